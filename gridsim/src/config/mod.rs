//! Profile loading.
//!
//! A simulation is described by a profile directory containing
//! `profile.json` plus any number of referenced files. Wherever a JSON
//! object carries a `"_file_"` key, the object is replaced by the content of
//! that file (relative to the profile directory), so large sections like the
//! infrastructure, the price catalogue or the link matrix live in their own
//! files:
//!
//! ```json
//! { "maxTick": 2592000,
//!   "rucio":  { "_file_": "rucio.json" },
//!   "clouds": [ { "id": "gcp", "name": "GCP", "_file_": "gcp.json" } ],
//!   "links":  { "_file_": "links.json" },
//!   "transferCfgs": [ ... ], "dataGens": [ ... ],
//!   "reaper": { "tickFreq": 600, "startTick": 600 } }
//! ```
//!
//! Configuration problems are fatal at startup; nothing here is recovered
//! from at runtime.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::common::random::ValueGenCfg;
use crate::common::{Space, Tick, SECONDS_PER_DAY};

/// Key marking a JSON object as living in a separate file.
pub const FILE_IMPORT_KEY: &str = "_file_";

const DEFAULT_MAX_TICK: Tick = 30 * SECONDS_PER_DAY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing config key: {0}")]
    MissingKey(String),
    #[error("unknown storage element: {0}")]
    UnknownStorageElement(String),
    #[error("no network link between {0} and {1}")]
    UnknownNetworkLink(String, String),
    #[error("name is not unique: {0}")]
    DuplicateName(String),
    #[error("unknown kind: {0}")]
    UnknownKind(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Resolves profile and config files from their directories.
pub struct ProfileLoader {
    config_dir: PathBuf,
    profile_dir: PathBuf,
}

impl ProfileLoader {
    pub fn new(config_dir: impl Into<PathBuf>, profile_dir: impl Into<PathBuf>) -> ProfileLoader {
        ProfileLoader {
            config_dir: config_dir.into(),
            profile_dir: profile_dir.into(),
        }
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    pub fn load_json(&self, path: &Path) -> Result<Value, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Loads a file relative to the config directory.
    pub fn load_config_file(&self, name: &str) -> Result<Value, ConfigError> {
        self.load_json(&self.config_dir.join(name))
    }

    /// Loads a file relative to the profile directory.
    pub fn load_profile_file(&self, name: &str) -> Result<Value, ConfigError> {
        self.load_json(&self.profile_dir.join(name))
    }

    /// Returns the content of the referenced file when `value` carries a
    /// `"_file_"` key, the value itself otherwise.
    pub fn resolve_section(&self, value: &Value) -> Result<Value, ConfigError> {
        match value.get(FILE_IMPORT_KEY).and_then(Value::as_str) {
            Some(file_name) => self.load_profile_file(file_name),
            None => Ok(value.clone()),
        }
    }
}

/// Top-level config of the `gsctl` binary (`simconfig.json`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimConfig {
    pub profile: Option<String>,
    #[serde(default)]
    pub output: OutputCfg,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputCfg {
    pub db_connection_file: Option<String>,
    pub db_init_file_name: Option<String>,
    pub insert_query_buffer_len: Option<usize>,
}

/// The grid infrastructure section.
#[derive(Debug, Clone, Deserialize)]
pub struct RucioCfg {
    pub sites: Vec<GridSiteCfg>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSiteCfg {
    pub name: String,
    pub location: String,
    pub multi_location_idx: u8,
    #[serde(default)]
    pub storage_elements: Vec<StorageElementCfg>,
    #[serde(flatten)]
    pub custom: HashMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageElementCfg {
    pub name: String,
    /// 0 means unlimited.
    #[serde(default)]
    pub limit: Space,
    #[serde(default)]
    pub allow_duplicate_replicas: bool,
    pub access_latency: Option<ValueGenCfg>,
}

/// One cloud of the profile: the factory id, the instance name and the
/// cloud-specific config (usually behind a file reference).
#[derive(Debug, Clone)]
pub struct CloudEntry {
    pub id: String,
    pub name: String,
    pub cfg: Value,
}

/// Link matrix: source element name to destination element name to link
/// parameters. Insertion order is preserved so ids and output rows are
/// stable across runs.
pub type LinksCfg = IndexMap<String, IndexMap<String, LinkCfg>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCfg {
    /// Shared data rate in bytes per second.
    pub bandwidth: Option<Space>,
    /// Per-transfer data rate in bytes per second; wins over `bandwidth`
    /// being absent, warns when both are set.
    pub throughput: Option<Space>,
    #[serde(default)]
    pub max_active_transfers: u32,
    pub receiving_link: Option<Box<LinkCfg>>,
}

impl LinkCfg {
    /// Picks the configured data rate and whether it is a throughput.
    pub fn datarate(&self, src: &str, dst: &str) -> Result<(Space, bool), ConfigError> {
        match (self.bandwidth, self.throughput) {
            (Some(bandwidth), Some(_)) => {
                log::warn!(
                    "both bandwidth and throughput configured for link {} -> {}",
                    src,
                    dst
                );
                Ok((bandwidth, false))
            }
            (Some(bandwidth), None) => Ok((bandwidth, false)),
            (None, Some(throughput)) => Ok((throughput, true)),
            (None, None) => Err(ConfigError::MissingKey(format!(
                "bandwidth of link {} -> {}",
                src, dst
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferCfg {
    pub manager: TransferManagerCfg,
    pub generator: TransferGenCfg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferManagerKind {
    Bandwidth,
    FixedTime,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferManagerCfg {
    #[serde(rename = "type")]
    pub kind: TransferManagerKind,
    pub name: String,
    pub tick_freq: Tick,
    #[serde(default)]
    pub start_tick: Tick,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum TransferGenCfg {
    #[serde(rename = "fixed", rename_all = "camelCase")]
    Fixed {
        name: String,
        tick_freq: Tick,
        #[serde(default)]
        start_tick: Tick,
        infos: Vec<FixedGenInfoCfg>,
    },
    #[serde(rename = "cloudBuffer", rename_all = "camelCase")]
    CloudBuffer {
        name: String,
        tick_freq: Tick,
        #[serde(default)]
        start_tick: Tick,
        #[serde(default)]
        delete_src_replica: bool,
        #[serde(default)]
        read_new_src_replicas: bool,
        infos: Vec<CloudBufferInfoCfg>,
    },
    #[serde(rename = "cachedSrc", rename_all = "camelCase")]
    CachedSrc {
        name: String,
        tick_freq: Tick,
        #[serde(default)]
        start_tick: Tick,
        num_per_day: u64,
        default_replica_lifetime: Tick,
        src_storage_elements: Vec<String>,
        cache_storage_elements: Vec<CacheElementCfg>,
        dst_storage_elements: Vec<String>,
        /// Share of transfers drawn from each access-count bin.
        access_count_ratios: Option<Vec<f32>>,
    },
    #[serde(rename = "jobIO", rename_all = "camelCase")]
    JobIo {
        name: String,
        tick_freq: Tick,
        #[serde(default)]
        start_tick: Tick,
        infos: Vec<JobIoSiteCfg>,
    },
    #[serde(rename = "hcdc", rename_all = "camelCase")]
    Hcdc {
        name: String,
        tick_freq: Tick,
        #[serde(default)]
        start_tick: Tick,
        config: HcdcCfg,
    },
    #[serde(rename = "jobSlot", rename_all = "camelCase")]
    JobSlot {
        name: String,
        tick_freq: Tick,
        #[serde(default)]
        start_tick: Tick,
        src_storage_element_prios: IndexMap<String, i32>,
        dst_infos: Vec<JobSlotDstCfg>,
    },
}

impl TransferGenCfg {
    pub fn name(&self) -> &str {
        match self {
            TransferGenCfg::Fixed { name, .. }
            | TransferGenCfg::CloudBuffer { name, .. }
            | TransferGenCfg::CachedSrc { name, .. }
            | TransferGenCfg::JobIo { name, .. }
            | TransferGenCfg::Hcdc { name, .. }
            | TransferGenCfg::JobSlot { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedGenInfoCfg {
    pub storage_element: String,
    pub destinations: IndexMap<String, ValueGenCfg>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudBufferInfoCfg {
    pub reusage_num_cfg: ValueGenCfg,
    pub src_storage_element: String,
    pub primary_dst_storage_element: String,
    pub secondary_dst_storage_element: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheElementCfg {
    pub size: u64,
    pub default_replica_lifetime: Tick,
    pub storage_element: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIoSiteCfg {
    pub num_cores: usize,
    pub core_fill_rate: usize,
    pub disk_limit_threshold: f64,
    pub job_duration_cfg: ValueGenCfg,
    pub num_output_cfg: ValueGenCfg,
    pub output_size_cfg: ValueGenCfg,
    pub cloud_storage_element: String,
    pub disk_storage_element: String,
    pub cpu_storage_element: String,
    pub output_storage_element: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HcdcCfg {
    pub production_start_time: Tick,
    pub num_cores: usize,
    pub num_job_submission_cfg: ValueGenCfg,
    pub reusage_num_cfg: ValueGenCfg,
    pub job_duration_cfg: ValueGenCfg,
    pub num_output_cfg: ValueGenCfg,
    pub output_size_cfg: ValueGenCfg,
    pub archive_storage_element: String,
    pub cold_storage_element: String,
    pub hot_storage_element: String,
    pub cpu_storage_element: String,
    pub output_storage_element: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSlotDstCfg {
    pub storage_element: String,
    pub num_max_slots: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataGenCfg {
    pub name: Option<String>,
    pub tick_freq: Tick,
    #[serde(default)]
    pub start_tick: Tick,
    pub num_files_cfg: ValueGenCfg,
    pub file_size_cfg: ValueGenCfg,
    pub lifetime_cfg: ValueGenCfg,
    pub storage_elements: Vec<String>,
    #[serde(default)]
    pub num_replica_ratios: Vec<f32>,
    #[serde(default)]
    pub select_storage_elements_randomly: bool,
    pub num_pre_sim_start_files: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaperCfg {
    pub tick_freq: Tick,
    pub start_tick: Tick,
}

impl Default for ReaperCfg {
    fn default() -> Self {
        ReaperCfg {
            tick_freq: 600,
            start_tick: 600,
        }
    }
}

/// A fully resolved simulation profile.
#[derive(Debug, Clone)]
pub struct Profile {
    pub max_tick: Tick,
    pub rucio: RucioCfg,
    pub clouds: Vec<CloudEntry>,
    pub links: LinksCfg,
    pub transfer_cfgs: Vec<TransferCfg>,
    pub data_gens: Vec<DataGenCfg>,
    pub reaper: ReaperCfg,
}

impl Profile {
    /// Loads `profile.json` from the loader's profile directory.
    pub fn load(loader: &ProfileLoader) -> Result<Profile, ConfigError> {
        let root = loader.load_profile_file("profile.json")?;
        Profile::parse(&root, loader)
    }

    /// Parses an already loaded profile value, resolving file references
    /// through `loader`.
    pub fn parse(root: &Value, loader: &ProfileLoader) -> Result<Profile, ConfigError> {
        let max_tick = root
            .get("maxTick")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_TICK);

        let rucio_section = loader.resolve_section(
            root.get("rucio")
                .ok_or_else(|| ConfigError::MissingKey("rucio".into()))?,
        )?;
        let rucio: RucioCfg = serde_json::from_value(
            rucio_section
                .get("rucio")
                .cloned()
                .ok_or_else(|| ConfigError::MissingKey("rucio".into()))?,
        )?;

        let mut clouds = Vec::new();
        if let Some(cloud_entries) = root.get("clouds").and_then(Value::as_array) {
            for entry in cloud_entries {
                let id = entry
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ConfigError::MissingKey("clouds[].id".into()))?
                    .to_owned();
                let name = entry
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ConfigError::MissingKey("clouds[].name".into()))?
                    .to_owned();
                let cfg = loader.resolve_section(entry)?;
                clouds.push(CloudEntry { id, name, cfg });
            }
        }

        let links_section = loader.resolve_section(
            root.get("links")
                .ok_or_else(|| ConfigError::MissingKey("links".into()))?,
        )?;
        let links: LinksCfg = serde_json::from_value(links_section)?;

        let transfer_cfgs = match root.get("transferCfgs") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Vec::new(),
        };
        let data_gens = match root.get("dataGens") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Vec::new(),
        };
        let reaper = match root.get("reaper") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => {
                log::info!("no reaper configured, using defaults");
                ReaperCfg::default()
            }
        };

        Ok(Profile {
            max_tick,
            rucio,
            clouds,
            links,
            transfer_cfgs,
            data_gens,
            reaper,
        })
    }
}
