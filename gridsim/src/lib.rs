//! Discrete-event simulator for federated grid and cloud data management.
//!
//! The simulator reproduces the long-running behaviour of a distributed
//! storage fabric: sites hold storage elements, storage elements hold file
//! replicas, directed network links carry transfers between them, and cloud
//! regions additionally accrue tiered storage, network and operation costs
//! that are rolled up into a monthly bill.
//!
//! Everything runs over a virtual clock. The [sim::Schedule] orders
//! [sim::Schedulable] events by their next call tick; transfer managers move
//! bytes, transfer generators decide which replica goes where, a data
//! generator injects files, a reaper evicts whatever expired and a heartbeat
//! prints progress. Results are streamed to an [output::Output] sink through
//! a bounded channel so the simulation thread never waits on I/O.
//!
//! A simulation is composed from a JSON profile directory, see
//! [config::Profile] and [sim::Simulation]. The `gsctl` binary is the usual
//! entry point:
//!
//! ```text
//! gsctl --config-dir ./config my-profile
//! ```
//!
//! All state is single threaded; the only spawned thread belongs to the
//! output sink. There is no async runtime, no wall-clock coupling and no
//! real I/O inside the core.

pub mod clouds;
pub mod common;
pub mod config;
pub mod infrastructure;
pub mod output;
pub mod sim;

pub use common::{Id, SimContext, Space, Tick};
pub use config::ConfigError;

/// Initialise `env_logger` for binaries and tests that want the default
/// setup. Safe to call more than once.
#[cfg(feature = "init_env_logger")]
pub fn init_env_logger() {
    let _ = env_logger::builder().format_timestamp_millis().try_init();
}
