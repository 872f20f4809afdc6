//! Storage elements.
//!
//! A storage element is the logical description of one storage area at a
//! site: a disk pool, a tape library, a cloud bucket. It owns the replicas
//! stored on it and the network links originating from it, and enforces the
//! allocation discipline: creating a replica reserves the full file size as
//! `allocated`, every transferred byte converts `allocated` into `used`, and
//! removal releases both shares. A successfully created replica can
//! therefore always be transferred in full.
//!
//! Cloud buckets attach a [BucketCostTracker] which turns the same state
//! changes into storage byte-seconds and operation counts for the monthly
//! bill.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use parking_lot::Mutex;

use crate::clouds::BucketCostTracker;
use crate::common::random::ValueGen;
use crate::common::{Ctx, Id, Space, Tick};
use crate::infrastructure::file::{FileRef, Replica, ReplicaRef};
use crate::infrastructure::link::{NetworkLink, NetworkLinkRef};
use crate::infrastructure::site::Site;

pub type StorageElementRef = Rc<StorageElement>;

/// Operations a storage element can be notified about. Cloud billing maps
/// `Insert` to a class A and `Get` to a class B operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Get,
    CreateTransfer,
    Delete,
    Custom,
}

/// Actions broadcast by a storage element. Listeners are held weakly; dead
/// entries are pruned while firing.
pub trait StorageElementListener {
    fn post_create_replica(&self, _replica: &ReplicaRef, _now: Tick) {}
    fn post_complete_replica(&self, _replica: &ReplicaRef, _now: Tick) {}
    fn pre_remove_replica(&self, _replica: &ReplicaRef, _now: Tick) {}
}

pub struct StorageElement {
    id: Id,
    name: String,
    site: Weak<Site>,
    /// 0 means unlimited.
    limit: Space,
    used: Cell<Space>,
    allocated: Cell<Space>,
    allow_duplicate_replicas: bool,
    access_latency: ValueGen,
    replicas: RefCell<Vec<ReplicaRef>>,
    network_links: RefCell<Vec<NetworkLinkRef>>,
    link_index: RefCell<HashMap<Id, usize>>,
    listeners: RefCell<Vec<Weak<dyn StorageElementListener>>>,
    cost: Option<BucketCostTracker>,
    /// Hook for a future parallel reaper; uncontended in the
    /// single-threaded baseline.
    replica_remove_mutex: Mutex<()>,
}

impl StorageElement {
    pub(crate) fn new(
        ctx: &Ctx,
        name: String,
        site: &Rc<Site>,
        allow_duplicate_replicas: bool,
        limit: Space,
        access_latency: ValueGen,
        cost: Option<BucketCostTracker>,
    ) -> StorageElementRef {
        Rc::new(StorageElement {
            id: ctx.ids.next(),
            name,
            site: Rc::downgrade(site),
            limit,
            used: Cell::new(0),
            allocated: Cell::new(0),
            allow_duplicate_replicas,
            access_latency,
            replicas: RefCell::new(Vec::new()),
            network_links: RefCell::new(Vec::new()),
            link_index: RefCell::new(HashMap::new()),
            listeners: RefCell::new(Vec::new()),
            cost,
            replica_remove_mutex: Mutex::new(()),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn site(&self) -> Rc<Site> {
        self.site.upgrade().expect("site outlives its storage elements")
    }

    pub fn limit(&self) -> Space {
        self.limit
    }

    pub fn used(&self) -> Space {
        self.used.get()
    }

    pub fn allocated(&self) -> Space {
        self.allocated.get()
    }

    pub fn access_latency(&self) -> &ValueGen {
        &self.access_latency
    }

    pub fn cost_tracker(&self) -> Option<&BucketCostTracker> {
        self.cost.as_ref()
    }

    /// Ratio of used storage to the limit; 0 for unlimited elements.
    pub fn used_ratio(&self) -> f64 {
        if self.limit > 0 {
            self.used.get() as f64 / self.limit as f64
        } else {
            0.0
        }
    }

    pub fn can_store(&self, volume: Space) -> bool {
        self.limit == 0 || self.used.get() + self.allocated.get() + volume <= self.limit
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.borrow().len()
    }

    /// Whether `replica` is still registered on this element. Holders of
    /// strong replica handles use this before a deferred removal, since the
    /// reaper may have been faster.
    pub fn holds_replica(&self, replica: &Replica) -> bool {
        self.replicas
            .borrow()
            .get(replica.index_at_storage_element())
            .map(|registered| registered.id() == replica.id())
            .unwrap_or(false)
    }

    pub fn replicas(&self) -> Vec<ReplicaRef> {
        self.replicas.borrow().clone()
    }

    pub fn add_listener(&self, listener: Weak<dyn StorageElementListener>) {
        self.listeners.borrow_mut().push(listener);
    }

    fn for_each_listener(&self, mut f: impl FnMut(&Rc<dyn StorageElementListener>)) {
        // Upgrade outside the borrow so listeners may call back into this
        // storage element.
        let live: Vec<_> = {
            let mut listeners = self.listeners.borrow_mut();
            listeners.retain(|weak| weak.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in &live {
            f(listener);
        }
    }

    /// Notifies the element (and its cost tracker) about an operation.
    pub fn on_operation(&self, op: Operation, _now: Tick) {
        if let Some(cost) = &self.cost {
            cost.on_operation(op);
        }
    }

    /// Creates a new, empty replica of `file` on this element.
    ///
    /// Returns `None` when the quota cannot hold another copy of the file
    /// or when duplicates are disallowed and one already exists; callers
    /// recover by skipping, retrying elsewhere or deferring.
    pub fn create_replica(self: &Rc<Self>, ctx: &Ctx, file: &FileRef, now: Tick) -> Option<ReplicaRef> {
        if !self.can_store(file.size()) {
            return None;
        }
        if !self.allow_duplicate_replicas && file.replica_at(self).is_some() {
            return None;
        }

        let replica = Replica::new(
            ctx.ids.next(),
            Rc::clone(file),
            self,
            now,
            self.replicas.borrow().len(),
        );
        file.post_create_replica(&replica);
        self.replicas.borrow_mut().push(Rc::clone(&replica));
        self.allocated.set(self.allocated.get() + file.size());

        self.on_operation(Operation::Insert, now);
        self.for_each_listener(|listener| listener.post_create_replica(&replica, now));

        Some(replica)
    }

    /// Converts `amount` bytes of this element's `allocated` share into
    /// `used`. Called by [Replica::increase]; fires the completion event
    /// exactly when the replica reaches the file size.
    pub(crate) fn on_increase_replica(&self, replica: &ReplicaRef, amount: Space, now: Tick) {
        if let Some(cost) = &self.cost {
            cost.accrue(self.used.get(), now);
        }
        debug_assert!(self.allocated.get() >= amount, "increase exceeds allocation");
        self.used.set(self.used.get() + amount);
        self.allocated.set(self.allocated.get() - amount);

        if amount > 0 && replica.is_complete() {
            self.for_each_listener(|listener| listener.post_complete_replica(replica, now));
        }
    }

    /// Removes a replica, firing the pre-remove listeners and the replica's
    /// transfer tag *before* the storage is released and the back-references
    /// are cut. `need_lock` exists for a future parallel reaper.
    pub fn remove_replica(&self, replica: &ReplicaRef, now: Tick, need_lock: bool) {
        assert_eq!(
            replica.storage_element_id(),
            self.id,
            "replica {} does not belong to storage element {}",
            replica.id(),
            self.name
        );

        self.for_each_listener(|listener| listener.pre_remove_replica(replica, now));
        if let Some(tag) = replica.take_pre_remove_tag() {
            tag.trip();
        }

        let _guard = if need_lock {
            Some(self.replica_remove_mutex.lock())
        } else {
            None
        };

        replica.file().pre_remove_replica(replica);

        if let Some(cost) = &self.cost {
            cost.accrue(self.used.get(), now);
        }

        let cur_size = replica.cur_size();
        let residual = replica.file().size() - cur_size;
        debug_assert!(self.used.get() >= cur_size);
        debug_assert!(self.allocated.get() >= residual);
        self.used.set(self.used.get() - cur_size);
        self.allocated.set(self.allocated.get() - residual);

        let mut replicas = self.replicas.borrow_mut();
        let idx = replica.index_at_storage_element();
        assert!(idx < replicas.len(), "stale replica index");
        let removed = replicas.swap_remove(idx);
        debug_assert_eq!(removed.id(), replica.id());
        if idx < replicas.len() {
            replicas[idx].set_index_at_storage_element(idx);
        }
        drop(replicas);

        self.on_operation(Operation::Delete, now);
    }

    /// Creates an outgoing link to `dst`. Each destination may be linked at
    /// most once; a second link to the same element is a configuration bug.
    pub fn create_network_link(
        self: &Rc<Self>,
        ctx: &Ctx,
        dst: &StorageElementRef,
        bandwidth_bytes_per_second: Space,
    ) -> NetworkLinkRef {
        let link = NetworkLink::new(ctx.ids.next(), self, dst, bandwidth_bytes_per_second);
        let mut index = self.link_index.borrow_mut();
        let mut links = self.network_links.borrow_mut();
        assert!(
            index.insert(dst.id(), links.len()).is_none(),
            "duplicate network link {} -> {}",
            self.name,
            dst.name()
        );
        links.push(Rc::clone(&link));
        link
    }

    pub fn network_links(&self) -> Vec<NetworkLinkRef> {
        self.network_links.borrow().clone()
    }

    pub fn network_link_to(&self, dst: &StorageElement) -> Option<NetworkLinkRef> {
        let index = self.link_index.borrow();
        let idx = *index.get(&dst.id())?;
        Some(Rc::clone(&self.network_links.borrow()[idx]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::testutil::test_ctx;
    use crate::infrastructure::file::File;
    use crate::infrastructure::site::SiteKind;

    fn test_site(ctx: &Ctx) -> Rc<Site> {
        Site::new(
            ctx,
            "site".into(),
            "somewhere".into(),
            0,
            SiteKind::Grid,
        )
    }

    fn element(ctx: &Ctx, limit: Space, allow_dup: bool) -> StorageElementRef {
        test_site(ctx).create_storage_element(
            ctx,
            "se".into(),
            allow_dup,
            limit,
            ValueGen::fixed(0.0),
            None,
        )
    }

    fn file(ctx: &Ctx, size: Space) -> FileRef {
        File::new(ctx.ids.next(), size, 0, 1000, 0)
    }

    #[test]
    fn create_replica_reserves_allocation() {
        let ctx = test_ctx();
        let se = element(&ctx, 0, true);
        let f = file(&ctx, 100);
        let replica = se.create_replica(&ctx, &f, 0).unwrap();
        assert_eq!(se.allocated(), 100);
        assert_eq!(se.used(), 0);
        assert!(!replica.is_complete());
        assert_eq!(f.replicas().len(), 1);
    }

    #[test]
    fn increase_converts_allocated_to_used_and_clips() {
        let ctx = test_ctx();
        let se = element(&ctx, 0, true);
        let f = file(&ctx, 100);
        let replica = se.create_replica(&ctx, &f, 0).unwrap();

        assert_eq!(replica.increase(60, 1), 60);
        assert_eq!(se.used(), 60);
        assert_eq!(se.allocated(), 40);

        // clipping: asking for more than the remainder applies the rest only
        assert_eq!(replica.increase(100, 2), 40);
        assert!(replica.is_complete());
        assert_eq!(se.used(), 100);
        assert_eq!(se.allocated(), 0);

        // idempotent once complete
        assert_eq!(replica.increase(10, 3), 0);
        assert_eq!(se.used(), 100);
    }

    #[test]
    fn quota_rejects_replica_that_does_not_fit() {
        let ctx = test_ctx();
        let se = element(&ctx, 150, true);
        let f = file(&ctx, 100);
        assert!(se.create_replica(&ctx, &f, 0).is_some());
        // 100 used+allocated, another 100 would exceed 150
        assert!(se.create_replica(&ctx, &file(&ctx, 100), 0).is_none());
        assert!(se.create_replica(&ctx, &file(&ctx, 50), 0).is_some());
    }

    #[test]
    fn unique_policy_rejects_second_replica_of_same_file() {
        let ctx = test_ctx();
        let se = element(&ctx, 0, false);
        let f = file(&ctx, 10);
        assert!(se.create_replica(&ctx, &f, 0).is_some());
        assert!(se.create_replica(&ctx, &f, 0).is_none());

        let dup = element(&ctx, 0, true);
        assert!(dup.create_replica(&ctx, &f, 0).is_some());
        assert!(dup.create_replica(&ctx, &f, 0).is_some());
    }

    #[test]
    fn remove_replica_releases_storage_and_fixes_indices() {
        let ctx = test_ctx();
        let se = element(&ctx, 0, true);
        let f1 = file(&ctx, 10);
        let f2 = file(&ctx, 20);
        let f3 = file(&ctx, 30);
        let r1 = se.create_replica(&ctx, &f1, 0).unwrap();
        let r2 = se.create_replica(&ctx, &f2, 0).unwrap();
        let r3 = se.create_replica(&ctx, &f3, 0).unwrap();
        r1.increase(10, 1);
        r2.increase(5, 1);

        se.remove_replica(&r1, 2, true);
        assert_eq!(se.used(), 5);
        assert_eq!(se.allocated(), 15 + 30);
        assert_eq!(se.num_replicas(), 2);
        // r3 was swapped into slot 0
        assert_eq!(r3.index_at_storage_element(), 0);
        assert!(f1.replicas().is_empty());

        se.remove_replica(&r3, 3, false);
        se.remove_replica(&r2, 3, false);
        assert_eq!(se.used(), 0);
        assert_eq!(se.allocated(), 0);
    }

    #[test]
    fn remove_replica_trips_transfer_tag() {
        let ctx = test_ctx();
        let se = element(&ctx, 0, true);
        let f = file(&ctx, 10);
        let replica = se.create_replica(&ctx, &f, 0).unwrap();
        let tag = Rc::new(crate::infrastructure::PreRemoveTag::default());
        replica.set_pre_remove_tag(Rc::clone(&tag));
        se.remove_replica(&replica, 1, true);
        assert!(tag.is_tripped());
    }

    #[test]
    fn network_links_are_unique_per_destination_and_indexed() {
        let ctx = test_ctx();
        let site = test_site(&ctx);
        let a = site.create_storage_element(&ctx, "a".into(), true, 0, ValueGen::fixed(0.0), None);
        let b = site.create_storage_element(&ctx, "b".into(), true, 0, ValueGen::fixed(0.0), None);
        let c = site.create_storage_element(&ctx, "c".into(), true, 0, ValueGen::fixed(0.0), None);

        let ab = a.create_network_link(&ctx, &b, 1000);
        let ac = a.create_network_link(&ctx, &c, 2000);
        assert_eq!(a.network_link_to(&b).unwrap().id(), ab.id());
        assert_eq!(a.network_link_to(&c).unwrap().id(), ac.id());
        assert!(b.network_link_to(&a).is_none());
    }

    #[test]
    fn bandwidth_share_honours_throughput_flag() {
        let ctx = test_ctx();
        let site = test_site(&ctx);
        let a = site.create_storage_element(&ctx, "a".into(), true, 0, ValueGen::fixed(0.0), None);
        let b = site.create_storage_element(&ctx, "b".into(), true, 0, ValueGen::fixed(0.0), None);
        let link = a.create_network_link(&ctx, &b, 1000);
        link.add_active(4);
        assert_eq!(link.transferred_bytes(2), 500);
        link.set_is_throughput(true);
        assert_eq!(link.transferred_bytes(2), 2000);
    }

    #[test]
    fn completion_event_fires_exactly_once() {
        use std::cell::Cell;

        #[derive(Default)]
        struct CountingListener {
            completed: Cell<u32>,
        }
        impl StorageElementListener for CountingListener {
            fn post_complete_replica(&self, _replica: &ReplicaRef, _now: Tick) {
                self.completed.set(self.completed.get() + 1);
            }
        }

        let ctx = test_ctx();
        let se = element(&ctx, 0, true);
        let listener: Rc<CountingListener> = Rc::new(CountingListener::default());
        let dynamic: Rc<dyn StorageElementListener> = listener.clone();
        se.add_listener(Rc::downgrade(&dynamic));

        let f = file(&ctx, 100);
        let replica = se.create_replica(&ctx, &f, 0).unwrap();
        replica.increase(50, 1);
        assert_eq!(listener.completed.get(), 0);
        replica.increase(50, 2);
        assert_eq!(listener.completed.get(), 1);
        replica.increase(50, 3);
        assert_eq!(listener.completed.get(), 1);
    }
}
