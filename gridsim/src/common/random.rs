//! Exchangeable numeric samplers.
//!
//! Most knobs of the simulation (file sizes, lifetimes, job durations,
//! submission rates) are described in the profile as a value generator: a
//! distribution plus optional min/max limiters. [ValueGen] is the runtime
//! form, [ValueGenCfg] the serde form found in profile JSON:
//!
//! ```json
//! { "type": "normal", "mean": 4.0, "stddev": 1.5,
//!   "minCfg": { "type": "minClip", "limit": 1.0 } }
//! ```

use rand::Rng;
use rand_distr::{Distribution, Exp, Geometric, Normal, Poisson, Weibull};
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Limits a sampled value from below or above.
#[derive(Debug, Clone, Copy)]
pub enum ValueLimiter {
    /// Adds the limit to the absolute input value.
    MinAdd { limit: f64 },
    /// Clamps the input value to at least the limit.
    MinClip { limit: f64 },
    /// Wraps values above the limit using modulo arithmetic.
    MaxModulo { limit: f64, invert: bool },
    /// Clamps the input value to at most the limit.
    MaxClip { limit: f64, invert: bool },
}

impl ValueLimiter {
    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            ValueLimiter::MinAdd { limit } => limit + value.abs(),
            ValueLimiter::MinClip { limit } => value.max(limit),
            ValueLimiter::MaxModulo { limit, invert } => {
                let mut v = value;
                if v > limit {
                    v = ((v as u64) % (limit as u64)) as f64;
                }
                if invert {
                    limit - v
                } else {
                    v
                }
            }
            ValueLimiter::MaxClip { limit, invert } => {
                let v = value.min(limit);
                if invert {
                    limit - v
                } else {
                    v
                }
            }
        }
    }

    pub fn limit(&self) -> f64 {
        match *self {
            ValueLimiter::MinAdd { limit }
            | ValueLimiter::MinClip { limit }
            | ValueLimiter::MaxModulo { limit, .. }
            | ValueLimiter::MaxClip { limit, .. } => limit,
        }
    }
}

#[derive(Debug, Clone)]
enum GenKind {
    Fixed(f64),
    Normal(Normal<f64>),
    Exponential(Exp<f64>),
    Poisson(Poisson<f64>),
    Weibull(Weibull<f64>),
    Geometric(Geometric),
}

/// A distribution with optional limiters. Sampling a random distribution
/// applies the max limiter before the min limiter; the fixed generator
/// applies min before max, mirroring how configured floors are meant to win
/// for constants.
#[derive(Debug, Clone)]
pub struct ValueGen {
    kind: GenKind,
    min: Option<ValueLimiter>,
    max: Option<ValueLimiter>,
}

impl ValueGen {
    pub fn fixed(value: f64) -> Self {
        ValueGen {
            kind: GenKind::Fixed(value),
            min: None,
            max: None,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match &self.kind {
            GenKind::Fixed(v) => self.min_then_max(*v),
            GenKind::Normal(d) => self.max_then_min(d.sample(rng)),
            GenKind::Exponential(d) => self.max_then_min(d.sample(rng)),
            GenKind::Poisson(d) => self.max_then_min(d.sample(rng)),
            GenKind::Weibull(d) => self.max_then_min(d.sample(rng)),
            GenKind::Geometric(d) => self.max_then_min(d.sample(rng) as f64),
        }
    }

    /// Sample clamped to zero and truncated, for counts.
    pub fn sample_count<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        self.sample(rng).max(0.0) as u64
    }

    fn min_then_max(&self, mut value: f64) -> f64 {
        if let Some(min) = &self.min {
            value = min.apply(value);
        }
        if let Some(max) = &self.max {
            value = max.apply(value);
        }
        value
    }

    fn max_then_min(&self, mut value: f64) -> f64 {
        if let Some(max) = &self.max {
            value = max.apply(value);
        }
        if let Some(min) = &self.min {
            value = min.apply(value);
        }
        value
    }

    pub fn from_cfg(cfg: &ValueGenCfg) -> Result<Self, ConfigError> {
        let bad = |what: &str| ConfigError::InvalidValue(format!("value generator: {}", what));
        let kind = match cfg {
            ValueGenCfg::Fixed { value, .. } => GenKind::Fixed(*value),
            ValueGenCfg::Normal { mean, stddev, .. } => {
                GenKind::Normal(Normal::new(*mean, *stddev).map_err(|_| bad("normal"))?)
            }
            ValueGenCfg::Exponential { lambda, .. } => {
                GenKind::Exponential(Exp::new(*lambda).map_err(|_| bad("exponential"))?)
            }
            ValueGenCfg::Poisson { mean, .. } => {
                GenKind::Poisson(Poisson::new(*mean).map_err(|_| bad("poisson"))?)
            }
            ValueGenCfg::Weibull { k, lambda, .. } => {
                GenKind::Weibull(Weibull::new(*lambda, *k).map_err(|_| bad("weibull"))?)
            }
            ValueGenCfg::Geometric { p, .. } => {
                GenKind::Geometric(Geometric::new(*p).map_err(|_| bad("geometric"))?)
            }
        };
        let (min_cfg, max_cfg) = cfg.limiters();
        let min = min_cfg.map(ValueLimiter::from_cfg).transpose()?;
        let max = max_cfg.map(ValueLimiter::from_cfg).transpose()?;
        if let (Some(min), Some(max)) = (&min, &max) {
            if min.limit() >= max.limit() {
                return Err(bad("min limit must be below max limit"));
            }
        }
        Ok(ValueGen { kind, min, max })
    }
}

impl ValueLimiter {
    pub fn from_cfg(cfg: &LimiterCfg) -> Result<Self, ConfigError> {
        let limiter = match cfg.kind.as_str() {
            "minAdd" => ValueLimiter::MinAdd { limit: cfg.limit },
            "minClip" => ValueLimiter::MinClip { limit: cfg.limit },
            "maxModulo" => ValueLimiter::MaxModulo {
                limit: cfg.limit,
                invert: cfg.invert,
            },
            "maxClip" => ValueLimiter::MaxClip {
                limit: cfg.limit,
                invert: cfg.invert,
            },
            other => {
                return Err(ConfigError::UnknownKind(format!(
                    "value limiter type: {}",
                    other
                )))
            }
        };
        Ok(limiter)
    }
}

/// Serde form of a value limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterCfg {
    #[serde(rename = "type")]
    pub kind: String,
    pub limit: f64,
    #[serde(default)]
    pub invert: bool,
}

/// Serde form of a value generator as it appears in profile JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ValueGenCfg {
    #[serde(rename_all = "camelCase")]
    Fixed {
        value: f64,
        #[serde(default)]
        min_cfg: Option<LimiterCfg>,
        #[serde(default)]
        max_cfg: Option<LimiterCfg>,
    },
    #[serde(rename_all = "camelCase")]
    Normal {
        mean: f64,
        stddev: f64,
        #[serde(default)]
        min_cfg: Option<LimiterCfg>,
        #[serde(default)]
        max_cfg: Option<LimiterCfg>,
    },
    #[serde(rename_all = "camelCase")]
    Exponential {
        lambda: f64,
        #[serde(default)]
        min_cfg: Option<LimiterCfg>,
        #[serde(default)]
        max_cfg: Option<LimiterCfg>,
    },
    #[serde(rename_all = "camelCase")]
    Poisson {
        mean: f64,
        #[serde(default)]
        min_cfg: Option<LimiterCfg>,
        #[serde(default)]
        max_cfg: Option<LimiterCfg>,
    },
    #[serde(rename_all = "camelCase")]
    Weibull {
        k: f64,
        #[serde(default = "default_weibull_lambda")]
        lambda: f64,
        #[serde(default)]
        min_cfg: Option<LimiterCfg>,
        #[serde(default)]
        max_cfg: Option<LimiterCfg>,
    },
    #[serde(rename_all = "camelCase")]
    Geometric {
        p: f64,
        #[serde(default)]
        min_cfg: Option<LimiterCfg>,
        #[serde(default)]
        max_cfg: Option<LimiterCfg>,
    },
}

fn default_weibull_lambda() -> f64 {
    1.0
}

impl ValueGenCfg {
    pub fn fixed(value: f64) -> Self {
        ValueGenCfg::Fixed {
            value,
            min_cfg: None,
            max_cfg: None,
        }
    }

    fn limiters(&self) -> (Option<&LimiterCfg>, Option<&LimiterCfg>) {
        match self {
            ValueGenCfg::Fixed {
                min_cfg, max_cfg, ..
            }
            | ValueGenCfg::Normal {
                min_cfg, max_cfg, ..
            }
            | ValueGenCfg::Exponential {
                min_cfg, max_cfg, ..
            }
            | ValueGenCfg::Poisson {
                min_cfg, max_cfg, ..
            }
            | ValueGenCfg::Weibull {
                min_cfg, max_cfg, ..
            }
            | ValueGenCfg::Geometric {
                min_cfg, max_cfg, ..
            } => (min_cfg.as_ref(), max_cfg.as_ref()),
        }
    }
}
