//! Directed point-to-point network links between storage elements.

use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::common::{Id, Space, Tick};
use crate::infrastructure::storage::StorageElement;

pub type NetworkLinkRef = Rc<NetworkLink>;

/// A directed edge between two storage elements. Owned by the source
/// element; transfer managers and the cloud billing pass update the
/// counters.
pub struct NetworkLink {
    id: Id,
    src: Weak<StorageElement>,
    dst: Weak<StorageElement>,
    bandwidth_bytes_per_second: Space,
    /// When set, every transfer enjoys the full configured rate instead of
    /// an equal share.
    is_throughput: Cell<bool>,
    /// 0 means unbounded.
    max_num_active_transfers: Cell<u32>,
    num_active: Cell<u32>,
    num_done: Cell<u64>,
    num_failed: Cell<u64>,
    used_traffic: Cell<Space>,
}

impl NetworkLink {
    pub(crate) fn new(
        id: Id,
        src: &Rc<StorageElement>,
        dst: &Rc<StorageElement>,
        bandwidth_bytes_per_second: Space,
    ) -> NetworkLinkRef {
        Rc::new(NetworkLink {
            id,
            src: Rc::downgrade(src),
            dst: Rc::downgrade(dst),
            bandwidth_bytes_per_second,
            is_throughput: Cell::new(false),
            max_num_active_transfers: Cell::new(0),
            num_active: Cell::new(0),
            num_done: Cell::new(0),
            num_failed: Cell::new(0),
            used_traffic: Cell::new(0),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn src(&self) -> Rc<StorageElement> {
        self.src.upgrade().expect("link source outlives the link")
    }

    pub fn dst(&self) -> Rc<StorageElement> {
        self.dst.upgrade().expect("link destination outlives the link")
    }

    pub fn bandwidth_bytes_per_second(&self) -> Space {
        self.bandwidth_bytes_per_second
    }

    pub fn is_throughput(&self) -> bool {
        self.is_throughput.get()
    }

    pub fn set_is_throughput(&self, is_throughput: bool) {
        self.is_throughput.set(is_throughput);
    }

    pub fn max_num_active_transfers(&self) -> u32 {
        self.max_num_active_transfers.get()
    }

    pub fn set_max_num_active_transfers(&self, max: u32) {
        self.max_num_active_transfers.set(max);
    }

    /// Whether another transfer may start on this link.
    pub fn has_free_slot(&self) -> bool {
        let max = self.max_num_active_transfers.get();
        max == 0 || self.num_active.get() < max
    }

    pub fn num_active(&self) -> u32 {
        self.num_active.get()
    }

    pub fn add_active(&self, delta: i64) {
        let new = self.num_active.get() as i64 + delta;
        debug_assert!(new >= 0, "active transfer count went negative");
        self.num_active.set(new.max(0) as u32);
    }

    pub fn num_done(&self) -> u64 {
        self.num_done.get()
    }

    pub fn count_done(&self) {
        self.num_done.set(self.num_done.get() + 1);
    }

    pub fn num_failed(&self) -> u64 {
        self.num_failed.get()
    }

    pub fn count_failed(&self) {
        self.num_failed.set(self.num_failed.get() + 1);
    }

    pub fn used_traffic(&self) -> Space {
        self.used_traffic.get()
    }

    pub fn add_traffic(&self, amount: Space) {
        self.used_traffic.set(self.used_traffic.get() + amount);
    }

    /// The per-transfer data rate at the current contention level for a
    /// window of `time_diff` ticks.
    pub fn transferred_bytes(&self, time_diff: Tick) -> Space {
        let rate = if self.is_throughput.get() || self.num_active.get() <= 1 {
            self.bandwidth_bytes_per_second as f64
        } else {
            self.bandwidth_bytes_per_second as f64 / self.num_active.get() as f64
        };
        (rate * time_diff as f64) as Space
    }

    /// Billing-boundary reset: traffic and done/failed counters start over.
    pub fn reset_billing_counters(&self) {
        self.used_traffic.set(0);
        self.num_done.set(0);
        self.num_failed.set(0);
    }
}
