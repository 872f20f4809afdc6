//! Cloud providers and cost accounting.
//!
//! A cloud owns regions (sites of kind [SiteKind::CloudRegion]), whose
//! storage elements are buckets carrying a [BucketCostTracker]. The tracker
//! converts state changes into storage byte-seconds and operation counts;
//! once a month [Cloud::process_billing] folds them through the tiered price
//! tables into a [Bill].

pub mod gcp;

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::common::{bytes_to_gib, Ctx, Space, Tick};
use crate::config::{ConfigError, ProfileLoader};
use crate::infrastructure::{Operation, SiteKind, SiteRef, StorageElementRef};

/// Tiered unit prices: `(start_usage_amount, price_per_unit_nano)` ordered
/// by ascending threshold. Prices are in nano currency units, as cloud
/// price catalogues publish them.
pub type TieredPrice = Vec<(u64, f64)>;

/// Folds an amount through a tiered price table. Each tier covers the span
/// between its start and the next tier's start; the last tier is unbounded.
pub fn tiered_cost(amount: f64, tiers: &[(u64, f64)]) -> f64 {
    fn fold(amount: f64, tiers: &[(u64, f64)], prev_threshold: u64) -> f64 {
        let (start, price) = tiers[0];
        debug_assert!(start >= prev_threshold);
        let span = (start - prev_threshold) as f64;
        if amount <= span || tiers.len() == 1 {
            return amount * price / 1e9;
        }
        span * price / 1e9 + fold(amount - span, &tiers[1..], start)
    }
    if tiers.is_empty() || amount <= 0.0 {
        return 0.0;
    }
    fold(amount, tiers, 0)
}

/// Monthly cost summary of one cloud.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bill {
    pub storage_cost: f64,
    pub network_cost: f64,
    pub traffic_gib: f64,
    pub operation_cost: f64,
    pub num_class_a: u64,
    pub num_class_b: u64,
}

impl fmt::Display for Bill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>12} {:.2} CHF", "Storage:", self.storage_cost)?;
        writeln!(
            f,
            "{:>12} {:.2} CHF ({:.2} GiB)",
            "Network:", self.network_cost, self.traffic_gib
        )?;
        writeln!(
            f,
            "{:>12} {:.2} CHF (ClassA: {}k + ClassB: {}k)",
            "Operations:",
            self.operation_cost,
            self.num_class_a / 1000,
            self.num_class_b / 1000
        )
    }
}

/// Per-bucket cost accounting, composed into a cloud storage element.
///
/// Storage cost accrues lazily: whenever the used volume is about to change
/// (or a bill is drawn) the time since the last update is charged at the
/// tier price matching the *current* used volume.
#[derive(Debug)]
pub struct BucketCostTracker {
    storage_price: TieredPrice,
    class_a_price: TieredPrice,
    class_b_price: TieredPrice,
    storage_cost: Cell<f64>,
    num_class_a: Cell<u64>,
    num_class_b: Cell<u64>,
    last_cost_update: Cell<Tick>,
}

impl BucketCostTracker {
    pub fn new(
        storage_price: TieredPrice,
        class_a_price: TieredPrice,
        class_b_price: TieredPrice,
    ) -> BucketCostTracker {
        BucketCostTracker {
            storage_price,
            class_a_price,
            class_b_price,
            storage_cost: Cell::new(0.0),
            num_class_a: Cell::new(0),
            num_class_b: Cell::new(0),
            last_cost_update: Cell::new(0),
        }
    }

    /// The storage unit price at the given used volume: the highest tier
    /// whose start threshold the volume exceeds.
    pub fn current_storage_price(&self, used: Space) -> f64 {
        debug_assert!(!self.storage_price.is_empty());
        let mut rate = self.storage_price[0].1;
        for (start, price) in self.storage_price.iter().skip(1) {
            if used > *start {
                rate = *price;
            } else {
                break;
            }
        }
        rate
    }

    /// Charges the elapsed time at the current used volume.
    pub fn accrue(&self, used: Space, now: Tick) {
        let last = self.last_cost_update.get();
        if now > last {
            let cost = bytes_to_gib(used) * self.current_storage_price(used) * (now - last) as f64
                / 1e9;
            self.storage_cost.set(self.storage_cost.get() + cost);
            self.last_cost_update.set(now);
        }
    }

    pub fn on_operation(&self, op: Operation) {
        match op {
            Operation::Insert => self.num_class_a.set(self.num_class_a.get() + 1),
            Operation::Get => self.num_class_b.set(self.num_class_b.get() + 1),
            _ => {}
        }
    }

    pub fn num_class_a(&self) -> u64 {
        self.num_class_a.get()
    }

    pub fn num_class_b(&self) -> u64 {
        self.num_class_b.get()
    }

    /// Read-and-reset of the accrued storage cost up to `now`.
    pub fn take_storage_cost(&self, used: Space, now: Tick) -> f64 {
        self.accrue(used, now);
        self.storage_cost.replace(0.0)
    }

    /// Read-and-reset of the operation cost and counters.
    pub fn take_operation_cost(&self) -> (f64, u64, u64) {
        let num_a = self.num_class_a.replace(0);
        let num_b = self.num_class_b.replace(0);
        let cost = tiered_cost(num_a as f64, &self.class_a_price)
            + tiered_cost(num_b as f64, &self.class_b_price);
        (cost, num_a, num_b)
    }
}

/// A cloud provider implementation.
pub trait Cloud {
    fn name(&self) -> &str;

    /// Applies the cloud section of the profile: price tables, regions and
    /// buckets.
    fn load_config(
        &self,
        ctx: &Ctx,
        loader: &ProfileLoader,
        cfg: &serde_json::Value,
    ) -> Result<(), ConfigError>;

    /// Resolves per-link network prices. Must run after all sites, storage
    /// elements and links exist.
    fn init_network_links(&self) -> Result<(), ConfigError>;

    /// Rolls the period since the previous call into a [Bill], resetting
    /// all accumulators, traffic and operation counters.
    fn process_billing(&self, now: Tick) -> Bill;

    fn regions(&self) -> Vec<SiteRef>;

    fn storage_element_by_name(&self, name: &str) -> Option<StorageElementRef> {
        self.regions()
            .iter()
            .flat_map(|region| region.storage_elements())
            .find(|element| element.name() == name)
    }
}

/// Explicit registry of cloud constructors, keyed by the `id` used in the
/// profile (`"gcp"` is built in).
pub struct CloudFactoryRegistry {
    factories: HashMap<String, Box<dyn Fn(String) -> Rc<dyn Cloud>>>,
}

impl CloudFactoryRegistry {
    pub fn empty() -> CloudFactoryRegistry {
        CloudFactoryRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtin() -> CloudFactoryRegistry {
        let mut registry = CloudFactoryRegistry::empty();
        registry.register("gcp", |name| Rc::new(gcp::GcpCloud::new(name)));
        registry
    }

    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(String) -> Rc<dyn Cloud> + 'static,
    {
        self.factories.insert(id.to_owned(), Box::new(factory));
    }

    pub fn create(&self, id: &str, name: String) -> Option<Rc<dyn Cloud>> {
        self.factories.get(id).map(|factory| factory(name))
    }
}

impl Default for CloudFactoryRegistry {
    fn default() -> Self {
        CloudFactoryRegistry::with_builtin()
    }
}

/// Convenience: whether a site belongs to any cloud region.
pub fn is_cloud_region(kind: &SiteKind) -> bool {
    matches!(kind, SiteKind::CloudRegion { .. })
}
