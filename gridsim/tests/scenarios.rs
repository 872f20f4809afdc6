//! End-to-end scenarios: a profile goes in, rows come out of the sink.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use gridsim::clouds::CloudFactoryRegistry;
use gridsim::common::{SECONDS_PER_DAY, SECONDS_PER_MONTH};
use gridsim::config::{ConfigError, Profile, ProfileLoader};
use gridsim::output::{MemoryDatabase, MemoryStore, Output, Value};
use gridsim::sim::Simulation;
use gridsim::SimContext;
use serde_json::json;

fn loader() -> ProfileLoader {
    ProfileLoader::new("/nonexistent", "/nonexistent")
}

/// Builds and runs a simulation from an inline profile, returning the
/// captured sink content.
fn run_profile(profile_json: serde_json::Value) -> Arc<MemoryStore> {
    let db = MemoryDatabase::default();
    let store = db.store();
    let output = Rc::new(RefCell::new(Output::new(Box::new(db), 4096)));
    let ctx = SimContext::new(Rc::clone(&output), Some(1234));

    let loader = loader();
    let profile = Profile::parse(&profile_json, &loader).expect("profile parses");
    let factories = CloudFactoryRegistry::default();
    let mut sim =
        Simulation::from_profile(ctx, &profile, &loader, &factories).expect("profile builds");

    output.borrow_mut().start_consumer().unwrap();
    sim.run();

    // every storage element must be empty after the final cleanup
    for site in sim.rucio().grid_sites() {
        for element in site.storage_elements() {
            assert_eq!(element.used(), 0, "{} still holds data", element.name());
            assert_eq!(element.allocated(), 0);
            assert_eq!(element.num_replicas(), 0);
        }
    }
    assert_eq!(sim.rucio().num_files(), 0);

    drop(sim);
    output.borrow_mut().shutdown();
    store
}

fn grid_profile() -> serde_json::Value {
    json!({
        "maxTick": 5000,
        "rucio": { "rucio": { "sites": [ {
            "name": "siteA", "location": "eu-west", "multiLocationIdx": 0,
            "storageElements": [
                { "name": "a-disk" },
                { "name": "b-disk" }
            ]
        } ] } },
        "links": {
            "a-disk": { "b-disk": { "bandwidth": 1073741824u64,
                                    "receivingLink": { "bandwidth": 1073741824u64 } } }
        },
        "transferCfgs": [ {
            "manager": { "type": "bandwidth", "name": "TransferMgr",
                         "tickFreq": 10, "startTick": 0 },
            "generator": { "type": "fixed", "name": "FixedGen", "tickFreq": 100,
                           "startTick": 50,
                           "infos": [ { "storageElement": "a-disk",
                                        "destinations": { "b-disk": { "type": "fixed", "value": 1.0 } } } ] }
        } ],
        "dataGens": [ {
            "tickFreq": 0, "startTick": 0,
            "numFilesCfg": { "type": "fixed", "value": 0.0 },
            "fileSizeCfg": { "type": "fixed", "value": 0.5 },
            "lifetimeCfg": { "type": "fixed", "value": 30.0 },
            "storageElements": [ "a-disk" ],
            "numPreSimStartFiles": 20
        } ],
        "reaper": { "tickFreq": 600, "startTick": 600 }
    })
}

#[test]
fn grid_profile_produces_topology_and_transfer_rows() {
    let store = run_profile(grid_profile());

    let queries = store.queries.lock().clone();
    assert_eq!(
        queries
            .iter()
            .filter(|q| q.starts_with("INSERT INTO Sites"))
            .count(),
        1
    );
    assert_eq!(
        queries
            .iter()
            .filter(|q| q.starts_with("INSERT INTO StorageElements"))
            .count(),
        2
    );
    assert_eq!(
        queries
            .iter()
            .filter(|q| q.starts_with("INSERT INTO NetworkLinks"))
            .count(),
        2
    );

    let transfers = store.rows_for("Transfers", 10);
    assert!(!transfers.is_empty(), "no transfers recorded");
    for row in &transfers {
        // queuedAt <= startedAt <= finishedAt
        let queued = match row[6] {
            Value::U64(v) => v,
            ref other => panic!("unexpected queuedAt {:?}", other),
        };
        let started = match row[7] {
            Value::U64(v) => v,
            ref other => panic!("unexpected startedAt {:?}", other),
        };
        let finished = match row[8] {
            Value::U64(v) => v,
            ref other => panic!("unexpected finishedAt {:?}", other),
        };
        assert!(queued <= started && started <= finished);
        // a completed 0.5 GiB file moved in full
        assert_eq!(row[9], Value::U64(1 << 29));
    }

    // the 20 pre-sim files were flushed through the deletion listener
    let files = store.rows_for("Files", 5);
    assert_eq!(files.len(), 20);
}

#[test]
fn reaped_files_emit_rows_exactly_once() {
    // five files whose replicas live for ~9 ticks; the reaper passes at 15
    let profile = json!({
        "maxTick": 100,
        "rucio": { "rucio": { "sites": [ {
            "name": "siteA", "location": "eu", "multiLocationIdx": 0,
            "storageElements": [ { "name": "a-disk" } ]
        } ] } },
        "links": {},
        "dataGens": [ {
            "tickFreq": 0, "startTick": 0,
            "numFilesCfg": { "type": "fixed", "value": 0.0 },
            "fileSizeCfg": { "type": "fixed", "value": 0.001 },
            "lifetimeCfg": { "type": "fixed", "value": 0.0001 },
            "storageElements": [ "a-disk" ],
            "numPreSimStartFiles": 5
        } ],
        "reaper": { "tickFreq": 15, "startTick": 15 }
    });
    let store = run_profile(profile);

    let files = store.rows_for("Files", 5);
    assert_eq!(files.len(), 5);
    let replicas = store.rows_for("Replicas", 5);
    assert_eq!(replicas.len(), 5);
    // all were gone before the simulation end, i.e. expiry stayed at the
    // configured ~8 ticks
    for row in &files {
        match row[2] {
            Value::U64(expired_at) => assert!(expired_at <= 15),
            ref other => panic!("unexpected expiredAt {:?}", other),
        }
    }
}

fn gcp_sku(sku_id: &str, usage_unit: &str, factor: f64, nanos: u64) -> serde_json::Value {
    json!({
        "skuId": sku_id,
        "pricingInfo": [ { "pricingExpression": {
            "usageUnit": usage_unit,
            "baseUnitConversionFactor": factor,
            "tieredRates": [ { "startUsageAmount": 0, "unitPrice": { "nanos": nanos } } ]
        } } ]
    })
}

#[test]
fn cloud_profile_bills_resident_storage_monthly() {
    let gib = 1_073_741_824.0;
    let month_factor = gib * SECONDS_PER_MONTH as f64;
    let profile = json!({
        "maxTick": SECONDS_PER_MONTH,
        "rucio": { "rucio": { "sites": [ {
            "name": "siteA", "location": "eu", "multiLocationIdx": 0,
            "storageElements": [ { "name": "a-disk" } ]
        } ] } },
        "clouds": [ {
            "id": "gcp", "name": "GCP",
            "gcp": {
                "skuIds": { "skus": [
                    gcp_sku("sku-storage", "GiBy.mo", month_factor, 20_000_000u64),
                    gcp_sku("sku-class-a", "count", 1.0, 10_000_000u64),
                    gcp_sku("sku-class-b", "count", 1.0, 1_000_000u64)
                ] },
                "networkPrices": {},
                "regions": [ {
                    "name": "europe-west1", "location": "eu", "multiLocationIdx": 1,
                    "buckets": [ { "name": "bucket",
                                   "storageSKUId": "sku-storage",
                                   "classAOpSKUId": "sku-class-a",
                                   "classBOpSKUId": "sku-class-b" } ]
                } ]
            }
        } ],
        "links": {},
        "dataGens": [ {
            "tickFreq": 0, "startTick": 0,
            "numFilesCfg": { "type": "fixed", "value": 0.0 },
            "fileSizeCfg": { "type": "fixed", "value": 100.0 },
            "lifetimeCfg": { "type": "fixed", "value": 365.0 },
            "storageElements": [ "bucket" ],
            "numPreSimStartFiles": 1
        } ],
        "reaper": { "tickFreq": 600, "startTick": 600 }
    });
    let store = run_profile(profile);

    let bills = store.rows_for("Bills", 3);
    assert_eq!(bills.len(), 1);
    assert_eq!(bills[0][0], Value::Text("GCP".into()));
    assert_eq!(bills[0][1], Value::U32(1));
    let text = match &bills[0][2] {
        Value::Text(text) => text.clone(),
        other => panic!("unexpected bill column {:?}", other),
    };
    // 100 GiB at 20M nano per GiB-month, resident for one month
    assert!(text.contains("2.00 CHF"), "bill was: {}", text);
}

#[test]
fn generator_manager_type_mismatch_is_rejected() {
    let mut profile = grid_profile();
    profile["transferCfgs"][0]["manager"]["type"] = json!("fixedTime");

    let db = MemoryDatabase::default();
    let output = Rc::new(RefCell::new(Output::new(Box::new(db), 64)));
    let ctx = SimContext::new(output, Some(1));
    let loader = loader();
    let parsed = Profile::parse(&profile, &loader).unwrap();
    let result = Simulation::from_profile(ctx, &parsed, &loader, &CloudFactoryRegistry::default());
    assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
}

#[test]
fn unknown_storage_element_reference_is_rejected() {
    let mut profile = grid_profile();
    profile["dataGens"][0]["storageElements"] = json!(["no-such-disk"]);

    let db = MemoryDatabase::default();
    let output = Rc::new(RefCell::new(Output::new(Box::new(db), 64)));
    let ctx = SimContext::new(output, Some(1));
    let loader = loader();
    let parsed = Profile::parse(&profile, &loader).unwrap();
    let result = Simulation::from_profile(ctx, &parsed, &loader, &CloudFactoryRegistry::default());
    assert!(matches!(
        result,
        Err(ConfigError::UnknownStorageElement(_))
    ));
}

#[test]
fn heartbeat_runs_without_disturbing_the_model() {
    // long enough for several heartbeats at the daily cadence
    let mut profile = grid_profile();
    profile["maxTick"] = json!(3 * SECONDS_PER_DAY);
    let store = run_profile(profile);
    assert!(!store.rows_for("Transfers", 10).is_empty());
}
