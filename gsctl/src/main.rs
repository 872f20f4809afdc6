//! Command line front end of the simulator.
//!
//! Loads `simconfig.json` from the config directory, resolves the profile
//! directory (positional argument wins over the config file), wires the
//! output sink and runs the simulation.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use figment::providers::{Format, Json};
use figment::Figment;
use structopt::StructOpt;

use gridsim::clouds::CloudFactoryRegistry;
use gridsim::config::{Profile, ProfileLoader, SimConfig};
use gridsim::output::{DummyDatabase, Output};
use gridsim::sim::Simulation;
use gridsim::SimContext;

const DEFAULT_INSERT_QUERY_BUFFER_LEN: usize = 250_000;

#[derive(Debug, StructOpt)]
#[structopt(name = "gsctl", about = "grid and cloud data management simulator")]
struct Opt {
    /// Profile directory under <config-dir>/profiles; defaults to the
    /// profile named in simconfig.json.
    profile: Option<String>,

    /// Directory holding simconfig.json and the profiles.
    #[structopt(long, parse(from_os_str), default_value = "config")]
    config_dir: PathBuf,

    /// Fixed RNG seed for reproducible runs.
    #[structopt(long)]
    seed: Option<u64>,
}

fn load_sim_config(config_dir: &PathBuf) -> Result<SimConfig> {
    let path = config_dir.join("simconfig.json");
    if !path.exists() {
        return Ok(SimConfig {
            profile: None,
            output: Default::default(),
        });
    }
    Figment::new()
        .merge(Json::file(&path))
        .extract()
        .with_context(|| format!("failed to load {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::builder().format_timestamp_millis().init();
    let started_at = chrono::Utc::now();

    let opt = Opt::from_args();
    let sim_config = load_sim_config(&opt.config_dir)?;

    let profile_name = opt
        .profile
        .or(sim_config.profile)
        .ok_or_else(|| anyhow!("no profile given on the command line or in simconfig.json"))?;
    let profile_dir = opt.config_dir.join("profiles").join(&profile_name);
    log::info!("using profile directory: {}", profile_dir.display());

    let loader = ProfileLoader::new(&opt.config_dir, &profile_dir);
    let profile = Profile::load(&loader)
        .with_context(|| format!("failed to load profile {}", profile_name))?;

    // the relational backends live outside the core; everything is driven
    // through the sink interface
    if sim_config.output.db_connection_file.is_some() {
        log::warn!("dbConnectionFile configured, but only the discarding backend is built in");
    }
    let buffer_len = sim_config
        .output
        .insert_query_buffer_len
        .unwrap_or(DEFAULT_INSERT_QUERY_BUFFER_LEN);
    let mut output = Output::new(Box::new(DummyDatabase::default()), buffer_len);

    if let Some(init_file) = &sim_config.output.db_init_file_name {
        let init_json = loader
            .load_config_file(init_file)
            .with_context(|| format!("failed to load {}", init_file))?;
        for (key, target) in [
            ("init", &mut output.init_queries),
            ("shutdown", &mut output.shutdown_queries),
        ] {
            if let Some(queries) = init_json.get(key).and_then(serde_json::Value::as_array) {
                for query in queries {
                    match query.as_str() {
                        Some(text) => target.push(text.to_owned()),
                        None => bail!("non-string query in {}.{}", init_file, key),
                    }
                }
            }
        }
    }

    let output = Rc::new(RefCell::new(output));
    let ctx = SimContext::new(Rc::clone(&output), opt.seed);

    log::info!("setting up simulation...");
    let factories = CloudFactoryRegistry::default();
    let mut sim = Simulation::from_profile(ctx, &profile, &loader, &factories)
        .context("failed to set up the simulation")?;

    output
        .borrow_mut()
        .start_consumer()
        .map_err(|err| anyhow!("failed to start output consumer: {}", err))?;

    sim.run();
    drop(sim);

    log::info!("finalising output...");
    output.borrow_mut().shutdown();

    let elapsed = chrono::Utc::now() - started_at;
    log::info!("simulation took {}s", elapsed.num_seconds());
    Ok(())
}
