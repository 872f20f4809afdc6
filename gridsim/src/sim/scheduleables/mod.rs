//! Schedulables: transfer managers, transfer generators, the data
//! generator, the reaper caller, billing and the heartbeat.

mod common;
pub mod generators;
mod transfer_manager;

pub use common::{BillingGenerator, DataGenerator, Heartbeat, ReaperCaller};
pub use transfer_manager::{
    BaseTransferManager, FixedTimeTransferManager, TransferManager, TransferStats,
};
