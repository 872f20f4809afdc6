//! Transfer managers.
//!
//! A transfer moves bytes from a source replica to a destination replica
//! over the network link connecting their storage elements:
//!
//! ```text
//! Queued --(start_at <= now)--> Active --(dst complete)--> Completed
//!                                   \--(src or dst removed)--> Failed
//! ```
//!
//! Queueing a transfer already occupies a slot on the link and counts a
//! `Get` on the source element. Per tick, both managers first promote
//! queued transfers whose start time arrived, then progress the active
//! ones. A completed transfer emits one row to the Transfers table; a
//! transfer whose source or destination replica disappeared (dead weak
//! handle or tripped pre-remove tag) is recorded as failed on its link and
//! never retried.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::common::{Ctx, Space, Tick};
use crate::infrastructure::{NetworkLinkRef, Operation, PreRemoveTag, Replica, ReplicaRef};
use crate::output::PreparedInsert;
use crate::sim::{SchedState, Schedulable};

const TRANSFERS_INSERT: &str = "COPY Transfers(id, srcStorageElementId, dstStorageElementId, \
     fileId, srcReplicaId, dstReplicaId, queuedAt, startedAt, finishedAt, traffic) \
     FROM STDIN with(FORMAT csv);";

/// Counters shared by every transfer manager flavour. The heartbeat reads
/// and resets them periodically.
#[derive(Debug, Default)]
pub struct TransferStats {
    num_completed: Cell<u32>,
    num_failed: Cell<u32>,
    summed_duration: Cell<Tick>,
}

impl TransferStats {
    pub fn num_completed(&self) -> u32 {
        self.num_completed.get()
    }

    pub fn num_failed(&self) -> u32 {
        self.num_failed.get()
    }

    pub fn summed_duration(&self) -> Tick {
        self.summed_duration.get()
    }

    fn count_completed(&self, duration: Tick) {
        self.num_completed.set(self.num_completed.get() + 1);
        self.summed_duration.set(self.summed_duration.get() + duration);
    }

    fn count_failed(&self) {
        self.num_failed.set(self.num_failed.get() + 1);
    }

    pub fn reset(&self) {
        self.num_completed.set(0);
        self.num_failed.set(0);
        self.summed_duration.set(0);
    }
}

/// The manager surface the heartbeat reports on.
pub trait BaseTransferManager {
    fn name(&self) -> &str;
    fn stats(&self) -> &TransferStats;
    fn num_active(&self) -> usize;
    fn num_queued(&self) -> usize;
}

struct Transfer {
    src: Weak<Replica>,
    dst: Weak<Replica>,
    link: NetworkLinkRef,
    queued_at: Tick,
    start_at: Tick,
    delete_src_on_complete: bool,
    /// Bytes applied to the destination per tick; only meaningful for the
    /// fixed-duration manager.
    increase_per_tick: Space,
    tag: Rc<PreRemoveTag>,
}

impl Transfer {
    fn new(
        src: &ReplicaRef,
        dst: &ReplicaRef,
        link: NetworkLinkRef,
        queued_at: Tick,
        start_at: Tick,
        delete_src_on_complete: bool,
        increase_per_tick: Space,
    ) -> Transfer {
        let tag = Rc::new(PreRemoveTag::default());
        src.set_pre_remove_tag(Rc::clone(&tag));
        dst.set_pre_remove_tag(Rc::clone(&tag));
        Transfer {
            src: Rc::downgrade(src),
            dst: Rc::downgrade(dst),
            link,
            queued_at,
            start_at,
            delete_src_on_complete,
            increase_per_tick,
            tag,
        }
    }

    /// Both endpoints, provided neither was removed in the meantime.
    fn endpoints(&self) -> Option<(ReplicaRef, ReplicaRef)> {
        if self.tag.is_tripped() {
            return None;
        }
        Some((self.src.upgrade()?, self.dst.upgrade()?))
    }
}

fn promote_due_transfers(queued: &mut Vec<Transfer>, active: &mut Vec<Transfer>, now: Tick) {
    let mut idx = 0;
    while idx < queued.len() {
        if queued[idx].start_at <= now {
            active.push(queued.swap_remove(idx));
        } else {
            idx += 1;
        }
    }
}

enum Progress {
    Ongoing,
    Completed { traffic: Space, started_at: Tick },
    Failed,
}

/// Shared per-transfer update: apply `amount` bytes to the destination and
/// classify the outcome.
fn progress_transfer(transfer: &Transfer, amount: Space, now: Tick) -> Progress {
    let (_src, dst) = match transfer.endpoints() {
        Some(endpoints) => endpoints,
        None => {
            transfer.link.count_failed();
            transfer.link.add_active(-1);
            return Progress::Failed;
        }
    };

    let applied = dst.increase(amount, now);
    transfer.link.add_traffic(applied);

    if dst.is_complete() {
        transfer.link.count_done();
        transfer.link.add_active(-1);
        Progress::Completed {
            traffic: dst.cur_size(),
            started_at: transfer.start_at,
        }
    } else {
        Progress::Ongoing
    }
}

fn push_transfer_row(
    container: &mut crate::output::ValuesContainer,
    ctx: &Ctx,
    transfer: &Transfer,
    now: Tick,
    traffic: Space,
) {
    // endpoints are alive, the transfer just completed
    let (src, dst) = match transfer.endpoints() {
        Some(endpoints) => endpoints,
        None => return,
    };
    container.add_value(ctx.ids.next());
    container.add_value(src.storage_element_id());
    container.add_value(dst.storage_element_id());
    container.add_value(src.file().id());
    container.add_value(src.id());
    container.add_value(dst.id());
    container.add_value(transfer.queued_at);
    container.add_value(transfer.start_at);
    container.add_value(now);
    container.add_value(traffic);
}

/// Bandwidth-shared transfer manager: active transfers on a link divide its
/// bandwidth equally, unless the link is configured as a throughput.
pub struct TransferManager {
    sched: SchedState,
    ctx: Ctx,
    tick_freq: Tick,
    last_updated: Cell<Tick>,
    queued: RefCell<Vec<Transfer>>,
    active: RefCell<Vec<Transfer>>,
    stats: TransferStats,
    insert: Rc<PreparedInsert>,
}

impl TransferManager {
    pub fn new(ctx: Ctx, name: impl Into<String>, tick_freq: Tick, start_tick: Tick) -> Rc<Self> {
        let insert = ctx.output.borrow().prepare_insert(TRANSFERS_INSERT, 10, '?');
        Rc::new(TransferManager {
            sched: SchedState::new(name, start_tick),
            ctx,
            tick_freq,
            last_updated: Cell::new(start_tick),
            queued: RefCell::new(Vec::new()),
            active: RefCell::new(Vec::new()),
            stats: TransferStats::default(),
            insert,
        })
    }

    /// Queues a transfer starting immediately. The link slot is taken right
    /// away and the source element sees a `Get`.
    pub fn create_transfer(
        &self,
        src: &ReplicaRef,
        dst: &ReplicaRef,
        now: Tick,
        delete_src_on_complete: bool,
    ) {
        let src_element = src.storage_element();
        let link = src_element
            .network_link_to(&dst.storage_element())
            .unwrap_or_else(|| {
                panic!(
                    "no network link {} -> {}",
                    src_element.name(),
                    dst.storage_element().name()
                )
            });
        link.add_active(1);
        src_element.on_operation(Operation::Get, now);
        self.queued.borrow_mut().push(Transfer::new(
            src,
            dst,
            link,
            now,
            now,
            delete_src_on_complete,
            0,
        ));
    }
}

impl BaseTransferManager for TransferManager {
    fn name(&self) -> &str {
        self.sched.name()
    }

    fn stats(&self) -> &TransferStats {
        &self.stats
    }

    fn num_active(&self) -> usize {
        self.active.borrow().len()
    }

    fn num_queued(&self) -> usize {
        self.queued.borrow().len()
    }
}

impl Schedulable for TransferManager {
    fn sched(&self) -> &SchedState {
        &self.sched
    }

    fn on_update(&self, now: Tick) {
        // promotion first, then progress
        {
            let mut queued = self.queued.borrow_mut();
            let mut active = self.active.borrow_mut();
            promote_due_transfers(&mut queued, &mut active, now);
        }

        let time_diff = now - self.last_updated.get();
        self.last_updated.set(now);

        let mut rows = self.insert.values_container(10 * 8);
        let mut active = self.active.borrow_mut();
        let mut idx = 0;
        while idx < active.len() {
            let transfer = &active[idx];
            let amount = transfer.link.transferred_bytes(time_diff);
            match progress_transfer(transfer, amount, now) {
                Progress::Ongoing => idx += 1,
                Progress::Completed {
                    traffic,
                    started_at,
                } => {
                    push_transfer_row(&mut rows, &self.ctx, transfer, now, traffic);
                    self.stats.count_completed(now - started_at);
                    if transfer.delete_src_on_complete {
                        if let Some(src) = transfer.src.upgrade() {
                            let element = src.storage_element();
                            if element.holds_replica(&src) {
                                element.remove_replica(&src, now, true);
                            }
                        }
                    }
                    active.swap_remove(idx);
                }
                Progress::Failed => {
                    self.stats.count_failed();
                    active.swap_remove(idx);
                }
            }
        }
        drop(active);

        self.ctx.output.borrow().queue_inserts(rows);
        self.sched.reschedule_at(now + self.tick_freq);
    }

    fn shutdown(&self, _now: Tick) {
        log::info!(
            "{}: shutdown with {} active / {} queued transfers left",
            self.sched.name(),
            self.num_active(),
            self.num_queued()
        );
    }
}

/// Fixed-duration transfer manager: a transfer finishes after its
/// configured duration regardless of link contention. Used for job-style
/// short transfers where the link is not the bottleneck.
pub struct FixedTimeTransferManager {
    sched: SchedState,
    ctx: Ctx,
    tick_freq: Tick,
    last_updated: Cell<Tick>,
    queued: RefCell<Vec<Transfer>>,
    active: RefCell<Vec<Transfer>>,
    stats: TransferStats,
    insert: Rc<PreparedInsert>,
}

impl FixedTimeTransferManager {
    pub fn new(ctx: Ctx, name: impl Into<String>, tick_freq: Tick, start_tick: Tick) -> Rc<Self> {
        let insert = ctx.output.borrow().prepare_insert(TRANSFERS_INSERT, 10, '?');
        Rc::new(FixedTimeTransferManager {
            sched: SchedState::new(name, start_tick),
            ctx,
            tick_freq,
            last_updated: Cell::new(start_tick),
            queued: RefCell::new(Vec::new()),
            active: RefCell::new(Vec::new()),
            stats: TransferStats::default(),
            insert,
        })
    }

    /// Queues a transfer that starts after `start_delay` and spreads the
    /// file over `duration` ticks. The extra byte per tick absorbs the
    /// integer division remainder; completion clamps at the file size.
    pub fn create_transfer(
        &self,
        src: &ReplicaRef,
        dst: &ReplicaRef,
        now: Tick,
        start_delay: Tick,
        duration: Tick,
    ) {
        let src_element = src.storage_element();
        let link = src_element
            .network_link_to(&dst.storage_element())
            .unwrap_or_else(|| {
                panic!(
                    "no network link {} -> {}",
                    src_element.name(),
                    dst.storage_element().name()
                )
            });
        let increase_per_tick = src.file().size() / duration.max(1) + 1;
        link.add_active(1);
        src_element.on_operation(Operation::Get, now);
        self.queued.borrow_mut().push(Transfer::new(
            src,
            dst,
            link,
            now,
            now + start_delay,
            false,
            increase_per_tick,
        ));
    }
}

impl BaseTransferManager for FixedTimeTransferManager {
    fn name(&self) -> &str {
        self.sched.name()
    }

    fn stats(&self) -> &TransferStats {
        &self.stats
    }

    fn num_active(&self) -> usize {
        self.active.borrow().len()
    }

    fn num_queued(&self) -> usize {
        self.queued.borrow().len()
    }
}

impl Schedulable for FixedTimeTransferManager {
    fn sched(&self) -> &SchedState {
        &self.sched
    }

    fn on_update(&self, now: Tick) {
        // promotion first, then progress
        {
            let mut queued = self.queued.borrow_mut();
            let mut active = self.active.borrow_mut();
            promote_due_transfers(&mut queued, &mut active, now);
        }

        let time_diff = now - self.last_updated.get();
        self.last_updated.set(now);

        let mut rows = self.insert.values_container(10 * 8);
        let mut active = self.active.borrow_mut();
        let mut idx = 0;
        while idx < active.len() {
            let transfer = &active[idx];
            let amount = transfer.increase_per_tick * time_diff;
            match progress_transfer(transfer, amount, now) {
                Progress::Ongoing => idx += 1,
                Progress::Completed {
                    traffic,
                    started_at,
                } => {
                    push_transfer_row(&mut rows, &self.ctx, transfer, now, traffic);
                    self.stats.count_completed(now - started_at);
                    active.swap_remove(idx);
                }
                Progress::Failed => {
                    self.stats.count_failed();
                    active.swap_remove(idx);
                }
            }
        }
        drop(active);

        self.ctx.output.borrow().queue_inserts(rows);
        self.sched.reschedule_at(now + self.tick_freq);
    }

    fn shutdown(&self, _now: Tick) {
        let mut queued_with_dst = 0usize;
        let mut queued_bytes: Space = 0;
        for transfer in self.queued.borrow().iter() {
            if let Some(dst) = transfer.dst.upgrade() {
                queued_with_dst += 1;
                queued_bytes += dst.file().size() - dst.cur_size();
            }
        }
        log::info!(
            "{}: shutdown with {} active, {} queued ({} of them live, {} bytes untransferred)",
            self.sched.name(),
            self.num_active(),
            self.num_queued(),
            queued_with_dst,
            queued_bytes
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::random::ValueGen;
    use crate::common::testutil::test_ctx;
    use crate::infrastructure::{Rucio, StorageElementRef};

    fn topology(ctx: &Ctx, bandwidth: Space) -> (Rc<Rucio>, StorageElementRef, StorageElementRef) {
        let rucio = Rucio::new(Rc::clone(ctx));
        let site = rucio.create_grid_site("site".into(), "eu".into(), 0);
        let src = site.create_storage_element(ctx, "src".into(), true, 0, ValueGen::fixed(0.0), None);
        let dst = site.create_storage_element(ctx, "dst".into(), true, 0, ValueGen::fixed(0.0), None);
        src.create_network_link(ctx, &dst, bandwidth);
        (rucio, src, dst)
    }

    #[test]
    fn bandwidth_transfer_completes_after_size_over_bandwidth() {
        let ctx = test_ctx();
        let (rucio, src, dst) = topology(&ctx, 1 << 30);
        let mgr = TransferManager::new(Rc::clone(&ctx), "mgr", 1, 0);

        let file = rucio.create_file(1 << 30, 0, 1000);
        let src_replica = src.create_replica(&ctx, &file, 0).unwrap();
        src_replica.increase(1 << 30, 0);
        let dst_replica = dst.create_replica(&ctx, &file, 0).unwrap();

        mgr.create_transfer(&src_replica, &dst_replica, 0, false);
        let link = src.network_link_to(&dst).unwrap();
        assert_eq!(link.num_active(), 1);

        mgr.on_update(0);
        assert!(!dst_replica.is_complete());
        mgr.on_update(1);
        assert!(dst_replica.is_complete());
        assert_eq!(link.num_done(), 1);
        assert_eq!(link.num_active(), 0);
        assert_eq!(link.used_traffic(), 1 << 30);
        assert_eq!(mgr.stats().num_completed(), 1);
        assert_eq!(mgr.num_active(), 0);
    }

    #[test]
    fn removed_source_fails_the_transfer_exactly_once() {
        let ctx = test_ctx();
        let (rucio, src, dst) = topology(&ctx, 1000);
        let mgr = TransferManager::new(Rc::clone(&ctx), "mgr", 1, 0);

        let file = rucio.create_file(10_000, 0, 1000);
        let src_replica = src.create_replica(&ctx, &file, 0).unwrap();
        src_replica.increase(10_000, 0);
        let dst_replica = dst.create_replica(&ctx, &file, 0).unwrap();
        mgr.create_transfer(&src_replica, &dst_replica, 0, false);

        src.remove_replica(&src_replica, 0, true);
        drop(src_replica);

        mgr.on_update(1);
        let link = src.network_link_to(&dst).unwrap();
        assert_eq!(link.num_failed(), 1);
        assert_eq!(link.num_active(), 0);
        assert_eq!(mgr.stats().num_failed(), 1);
        mgr.on_update(2);
        assert_eq!(mgr.stats().num_failed(), 1);
    }

    #[test]
    fn delete_src_on_complete_removes_the_source_replica() {
        let ctx = test_ctx();
        let (rucio, src, dst) = topology(&ctx, 1 << 30);
        let mgr = TransferManager::new(Rc::clone(&ctx), "mgr", 1, 0);

        let file = rucio.create_file(1024, 0, 1000);
        let src_replica = src.create_replica(&ctx, &file, 0).unwrap();
        src_replica.increase(1024, 0);
        let dst_replica = dst.create_replica(&ctx, &file, 0).unwrap();
        mgr.create_transfer(&src_replica, &dst_replica, 0, true);
        drop(src_replica);

        mgr.on_update(1);
        assert!(dst_replica.is_complete());
        assert_eq!(src.num_replicas(), 0);
        assert_eq!(file.replicas().len(), 1);
    }

    #[test]
    fn fixed_time_transfer_tracks_duration_not_contention() {
        let ctx = test_ctx();
        let (rucio, src, dst) = topology(&ctx, 1);
        let mgr = FixedTimeTransferManager::new(Rc::clone(&ctx), "mgr", 1, 0);

        let size = 600 * (1u64 << 20);
        let file = rucio.create_file(size, 0, 100_000);
        let src_replica = src.create_replica(&ctx, &file, 0).unwrap();
        src_replica.increase(size, 0);
        let dst_replica = dst.create_replica(&ctx, &file, 0).unwrap();
        mgr.create_transfer(&src_replica, &dst_replica, 0, 0, 60);

        for now in 1..=30 {
            mgr.on_update(now);
        }
        // half way through, within the one-byte-per-tick rounding guard
        let half = size / 2;
        assert!(dst_replica.cur_size() >= half && dst_replica.cur_size() <= half + 30);
        assert!(!dst_replica.is_complete());

        for now in 31..=60 {
            mgr.on_update(now);
        }
        assert!(dst_replica.is_complete());
        assert_eq!(dst_replica.cur_size(), size);
        assert_eq!(mgr.stats().num_completed(), 1);
        assert_eq!(mgr.num_active(), 0);
    }

    #[test]
    fn start_delay_keeps_transfer_queued() {
        let ctx = test_ctx();
        let (rucio, src, dst) = topology(&ctx, 1000);
        let mgr = FixedTimeTransferManager::new(Rc::clone(&ctx), "mgr", 1, 0);

        let file = rucio.create_file(100, 0, 1000);
        let src_replica = src.create_replica(&ctx, &file, 0).unwrap();
        src_replica.increase(100, 0);
        let dst_replica = dst.create_replica(&ctx, &file, 0).unwrap();
        mgr.create_transfer(&src_replica, &dst_replica, 0, 10, 5);

        mgr.on_update(5);
        assert_eq!(mgr.num_queued(), 1);
        assert_eq!(mgr.num_active(), 0);
        assert_eq!(dst_replica.cur_size(), 0);

        mgr.on_update(10);
        assert_eq!(mgr.num_queued(), 0);
        assert!(dst_replica.cur_size() > 0);
    }

    #[test]
    fn two_transfers_share_link_bandwidth() {
        let ctx = test_ctx();
        let (rucio, src, dst) = topology(&ctx, 1000);
        let mgr = TransferManager::new(Rc::clone(&ctx), "mgr", 1, 0);

        let file_a = rucio.create_file(10_000, 0, 1000);
        let file_b = rucio.create_file(10_000, 0, 1000);
        let src_a = src.create_replica(&ctx, &file_a, 0).unwrap();
        src_a.increase(10_000, 0);
        let src_b = src.create_replica(&ctx, &file_b, 0).unwrap();
        src_b.increase(10_000, 0);
        let dst_a = dst.create_replica(&ctx, &file_a, 0).unwrap();
        let dst_b = dst.create_replica(&ctx, &file_b, 0).unwrap();

        mgr.create_transfer(&src_a, &dst_a, 0, false);
        mgr.create_transfer(&src_b, &dst_b, 0, false);

        mgr.on_update(2);
        // 2 ticks at 500 B/s each
        assert_eq!(dst_a.cur_size(), 1000);
        assert_eq!(dst_b.cur_size(), 1000);
    }
}
