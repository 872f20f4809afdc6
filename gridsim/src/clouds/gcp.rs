//! Google Cloud Platform shaped cloud implementation.
//!
//! Prices come straight from the exported GCP price catalogue: every
//! service (storage class, operation class, network egress path) is an SKU
//! whose `pricingExpression` carries tiered rates in nano units. The config
//! maps buckets to their storage/operation SKUs and network paths to egress
//! SKUs keyed by the `multiLocationIdx` of source and destination.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::Deserialize;
use serde_json::Value;

use crate::clouds::{
    is_cloud_region, tiered_cost, Bill, BucketCostTracker, Cloud, TieredPrice,
};
use crate::common::random::ValueGen;
use crate::common::{bytes_to_gib, Ctx, Id, Space, Tick, ONE_GIB};
use crate::config::{ConfigError, ProfileLoader};
use crate::infrastructure::{Site, SiteKind, SiteRef};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketCfg {
    name: String,
    #[serde(rename = "storageSKUId")]
    storage_sku_id: String,
    #[serde(rename = "classAOpSKUId")]
    class_a_op_sku_id: String,
    #[serde(rename = "classBOpSKUId")]
    class_b_op_sku_id: String,
    #[serde(default)]
    quota: Space,
    #[serde(default)]
    allow_duplicate_replicas: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegionCfg {
    name: String,
    location: String,
    multi_location_idx: u8,
    #[serde(default)]
    buckets: Vec<BucketCfg>,
    #[serde(flatten)]
    custom: HashMap<String, Value>,
}

pub struct GcpCloud {
    name: String,
    regions: RefCell<Vec<SiteRef>>,
    sku_settings: RefCell<HashMap<String, Value>>,
    network_prices: RefCell<Value>,
    link_prices: RefCell<HashMap<Id, TieredPrice>>,
}

impl GcpCloud {
    pub fn new(name: String) -> GcpCloud {
        GcpCloud {
            name,
            regions: RefCell::new(Vec::new()),
            sku_settings: RefCell::new(HashMap::new()),
            network_prices: RefCell::new(Value::Null),
            link_prices: RefCell::new(HashMap::new()),
        }
    }

    /// Extracts the tiered rate of an SKU, normalising the price to nano
    /// units per base unit (bytes for storage-time, GiB for traffic, counts
    /// for operations) via `usageUnit` and `baseUnitConversionFactor`.
    fn tiered_rate_from_sku(&self, sku_id: &str) -> Result<TieredPrice, ConfigError> {
        let settings = self.sku_settings.borrow();
        let sku = settings
            .get(sku_id)
            .ok_or_else(|| ConfigError::MissingKey(format!("SKU id {}", sku_id)))?;
        let pricing = sku
            .pointer("/pricingInfo/0/pricingExpression")
            .ok_or_else(|| ConfigError::MissingKey(format!("pricingExpression of {}", sku_id)))?;

        let usage_unit = pricing
            .get("usageUnit")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::MissingKey(format!("usageUnit of {}", sku_id)))?;
        let base_factor = pricing
            .get("baseUnitConversionFactor")
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        let conversion = match usage_unit {
            "GiBy.mo" | "GiBy.d" => base_factor / ONE_GIB,
            "By" => 1.0 / ONE_GIB,
            "count" | "GiBy" => 1.0,
            other => {
                log::warn!("unknown usageUnit {} for SKU {}", other, sku_id);
                1.0
            }
        };

        let rates = pricing
            .get("tieredRates")
            .and_then(Value::as_array)
            .ok_or_else(|| ConfigError::MissingKey(format!("tieredRates of {}", sku_id)))?;
        let mut prices = TieredPrice::new();
        for rate in rates {
            let start = rate
                .get("startUsageAmount")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    ConfigError::MissingKey(format!("startUsageAmount of {}", sku_id))
                })?;
            let nanos = rate
                .pointer("/unitPrice/nanos")
                .and_then(Value::as_f64)
                .ok_or_else(|| ConfigError::MissingKey(format!("unitPrice of {}", sku_id)))?;
            prices.push((start, nanos / conversion));
        }
        if prices.is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "SKU {} has no tiered rates",
                sku_id
            )));
        }
        Ok(prices)
    }
}

impl Cloud for GcpCloud {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_config(
        &self,
        ctx: &Ctx,
        loader: &ProfileLoader,
        cfg: &Value,
    ) -> Result<(), ConfigError> {
        let gcp_cfg = cfg
            .get("gcp")
            .ok_or_else(|| ConfigError::MissingKey("gcp".into()))?;

        let sku_ids = loader.resolve_section(
            gcp_cfg
                .get("skuIds")
                .ok_or_else(|| ConfigError::MissingKey("gcp.skuIds".into()))?,
        )?;
        {
            let skus = sku_ids
                .get("skus")
                .and_then(Value::as_array)
                .ok_or_else(|| ConfigError::MissingKey("gcp.skuIds.skus".into()))?;
            let mut settings = self.sku_settings.borrow_mut();
            for sku in skus {
                let sku_id = sku
                    .get("skuId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ConfigError::MissingKey("skuId".into()))?;
                if settings.contains_key(sku_id) {
                    log::warn!("ignoring second object for SKU id {}", sku_id);
                    continue;
                }
                settings.insert(sku_id.to_owned(), sku.clone());
            }
        }

        *self.network_prices.borrow_mut() = loader.resolve_section(
            gcp_cfg
                .get("networkPrices")
                .ok_or_else(|| ConfigError::MissingKey("gcp.networkPrices".into()))?,
        )?;

        let regions = gcp_cfg
            .get("regions")
            .and_then(Value::as_array)
            .ok_or_else(|| ConfigError::MissingKey("gcp.regions".into()))?;
        for region_value in regions {
            let region_cfg: RegionCfg = serde_json::from_value(region_value.clone())?;
            let region = Site::new(
                ctx,
                region_cfg.name,
                region_cfg.location,
                region_cfg.multi_location_idx,
                SiteKind::CloudRegion {
                    cloud_name: self.name.clone(),
                },
            );
            for bucket_cfg in &region_cfg.buckets {
                let tracker = BucketCostTracker::new(
                    self.tiered_rate_from_sku(&bucket_cfg.storage_sku_id)?,
                    self.tiered_rate_from_sku(&bucket_cfg.class_a_op_sku_id)?,
                    self.tiered_rate_from_sku(&bucket_cfg.class_b_op_sku_id)?,
                );
                region.create_storage_element(
                    ctx,
                    bucket_cfg.name.clone(),
                    bucket_cfg.allow_duplicate_replicas,
                    bucket_cfg.quota,
                    ValueGen::fixed(0.0),
                    Some(tracker),
                );
            }
            let custom = region_cfg
                .custom
                .iter()
                .map(|(key, value)| {
                    let text = match value.as_str() {
                        Some(s) => s.to_owned(),
                        None => value.to_string(),
                    };
                    (key.clone(), text)
                })
                .collect();
            region.set_custom_config(custom);
            self.regions.borrow_mut().push(region);
        }

        Ok(())
    }

    fn init_network_links(&self) -> Result<(), ConfigError> {
        let network_prices = self.network_prices.borrow();
        let mut link_prices = self.link_prices.borrow_mut();
        for region in self.regions.borrow().iter() {
            let src_idx = region.multi_location_idx().to_string();
            for bucket in region.storage_elements() {
                for link in bucket.network_links() {
                    let dst_site = link.dst().site();
                    let dst_idx = dst_site.multi_location_idx().to_string();
                    let sku_id = if is_cloud_region(dst_site.kind()) {
                        network_prices
                            .pointer(&format!("/interregion/{}/{}/skuId", src_idx, dst_idx))
                    } else {
                        network_prices.pointer(&format!("/download/{}/skuId", dst_idx))
                    };
                    let sku_id = sku_id.and_then(Value::as_str).ok_or_else(|| {
                        ConfigError::MissingKey(format!(
                            "network price for link {} -> {}",
                            bucket.name(),
                            link.dst().name()
                        ))
                    })?;
                    link_prices.insert(link.id(), self.tiered_rate_from_sku(sku_id)?);
                }
            }
        }
        Ok(())
    }

    fn process_billing(&self, now: Tick) -> Bill {
        let mut bill = Bill::default();
        let link_prices = self.link_prices.borrow();
        for region in self.regions.borrow().iter() {
            for bucket in region.storage_elements() {
                let tracker = match bucket.cost_tracker() {
                    Some(tracker) => tracker,
                    None => continue,
                };
                bill.storage_cost += tracker.take_storage_cost(bucket.used(), now);
                let (op_cost, num_a, num_b) = tracker.take_operation_cost();
                bill.operation_cost += op_cost;
                bill.num_class_a += num_a;
                bill.num_class_b += num_b;

                for link in bucket.network_links() {
                    let traffic_gib = bytes_to_gib(link.used_traffic());
                    if let Some(price) = link_prices.get(&link.id()) {
                        bill.network_cost += tiered_cost(traffic_gib, price);
                    }
                    bill.traffic_gib += traffic_gib;
                    link.reset_billing_counters();
                }
            }
        }
        bill
    }

    fn regions(&self) -> Vec<SiteRef> {
        self.regions.borrow().clone()
    }
}

/// Builds a cloud region outside of profile loading. The integration tests
/// use this to assemble small billing topologies by hand.
pub fn create_region_for_tests(
    cloud: &GcpCloud,
    ctx: &Ctx,
    name: &str,
    location: &str,
    multi_location_idx: u8,
) -> SiteRef {
    let region = Site::new(
        ctx,
        name.to_owned(),
        location.to_owned(),
        multi_location_idx,
        SiteKind::CloudRegion {
            cloud_name: cloud.name.clone(),
        },
    );
    cloud.regions.borrow_mut().push(Rc::clone(&region));
    region
}
