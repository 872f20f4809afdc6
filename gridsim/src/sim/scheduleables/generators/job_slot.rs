//! Slot-based transfer generation.
//!
//! Each destination owns a pool of job slots. Slots occupied by earlier
//! rounds free up as their finish tick passes; each update may start a
//! small flexible contingent of new transfers on the free slots, picking a
//! random file and its best-priority source replica.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::common::{Ctx, Id, Tick, SECONDS_PER_DAY};
use crate::infrastructure::{ReplicaRef, Rucio, StorageElementRef};
use crate::sim::scheduleables::FixedTimeTransferManager;
use crate::sim::{SchedState, Schedulable};

/// Retries when a randomly picked file is unusable.
const FILE_PICK_RETRIES: u32 = 10;
/// Transfers started now block their slot until `now + SLOT_HOLD`.
const SLOT_HOLD: Tick = 900;
/// Fixed transfer duration, as for the cached-source generator.
const TRANSFER_DURATION: Tick = 60;

/// Slot pool of one destination element.
pub struct JobSlotInfo {
    pub dst: StorageElementRef,
    pub num_max_slots: u32,
    /// Pairs of (finish tick, slots held until then).
    schedule: RefCell<Vec<(Tick, u32)>>,
}

impl JobSlotInfo {
    pub fn new(dst: StorageElementRef, num_max_slots: u32) -> JobSlotInfo {
        JobSlotInfo {
            dst,
            num_max_slots,
            schedule: RefCell::new(Vec::new()),
        }
    }

    pub fn used_slots(&self) -> u32 {
        self.schedule.borrow().iter().map(|(_, count)| count).sum()
    }
}

pub struct JobSlotTransferGen {
    sched: SchedState,
    ctx: Ctx,
    rucio: Rc<Rucio>,
    mgr: Rc<FixedTimeTransferManager>,
    tick_freq: Tick,
    /// Lower value means higher priority; sources without an entry are not
    /// considered.
    pub src_priorities: HashMap<Id, i32>,
    dst_infos: Vec<JobSlotInfo>,
}

impl JobSlotTransferGen {
    pub fn new(
        ctx: Ctx,
        name: impl Into<String>,
        rucio: Rc<Rucio>,
        mgr: Rc<FixedTimeTransferManager>,
        src_priorities: HashMap<Id, i32>,
        dst_infos: Vec<JobSlotInfo>,
        tick_freq: Tick,
        start_tick: Tick,
    ) -> Rc<Self> {
        Rc::new(JobSlotTransferGen {
            sched: SchedState::new(name, start_tick),
            ctx,
            rucio,
            mgr,
            tick_freq,
            src_priorities,
            dst_infos,
        })
    }

    pub fn dst_infos(&self) -> &[JobSlotInfo] {
        &self.dst_infos
    }

    /// Best-priority complete source replica of `file`; `None` when no
    /// prioritised source holds one.
    fn best_src_replica(&self, file_replicas: &[ReplicaRef]) -> Option<ReplicaRef> {
        let mut best: Option<(i32, ReplicaRef)> = None;
        for replica in file_replicas {
            if !replica.is_complete() {
                continue;
            }
            let prio = match self.src_priorities.get(&replica.storage_element_id()) {
                Some(prio) => *prio,
                None => continue,
            };
            match &best {
                Some((best_prio, _)) if *best_prio <= prio => {}
                _ => best = Some((prio, Rc::clone(replica))),
            }
        }
        best.map(|(_, replica)| replica)
    }
}

impl Schedulable for JobSlotTransferGen {
    fn sched(&self) -> &SchedState {
        &self.sched
    }

    fn on_update(&self, now: Tick) {
        let files = self.rucio.files();
        if files.is_empty() {
            self.sched.reschedule_at(now + self.tick_freq);
            return;
        }

        for info in &self.dst_infos {
            // reclaim finished slots
            let used_slots: u32 = {
                let mut schedule = info.schedule.borrow_mut();
                schedule.retain(|(finish, _)| *finish > now);
                schedule.iter().map(|(_, count)| count).sum()
            };
            debug_assert!(info.num_max_slots >= used_slots);

            let free_slots = info.num_max_slots - used_slots;
            let flex_limit =
                free_slots.min(1 + (0.01 * info.num_max_slots as f64) as u32);

            let mut started = 0u32;
            for _ in 0..flex_limit {
                // random file with at least one usable replica
                let mut picked = None;
                for _ in 0..FILE_PICK_RETRIES {
                    let candidate = {
                        let mut rng = self.ctx.rng.borrow_mut();
                        let idx = rand::Rng::gen_range(&mut *rng, 0..files.len());
                        Rc::clone(&files[idx])
                    };
                    if candidate.replicas().is_empty() || candidate.expires_at() < now + 100 {
                        continue;
                    }
                    picked = Some(candidate);
                    break;
                }
                let file = match picked {
                    Some(file) => file,
                    None => continue,
                };

                let new_replica = match info.dst.create_replica(&self.ctx, &file, now) {
                    Some(replica) => replica,
                    // replica already there or no quota left
                    None => continue,
                };
                new_replica.set_expires_at(now + SECONDS_PER_DAY);

                match self.best_src_replica(&file.replicas()) {
                    Some(src_replica) => {
                        self.mgr.create_transfer(
                            &src_replica,
                            &new_replica,
                            now,
                            0,
                            TRANSFER_DURATION,
                        );
                        started += 1;
                    }
                    None => {
                        info.dst.remove_replica(&new_replica, now, true);
                    }
                }
            }

            if started > 0 {
                info.schedule.borrow_mut().push((now + SLOT_HOLD, started));
            }
        }

        self.sched.reschedule_at(now + self.tick_freq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::random::ValueGen;
    use crate::common::testutil::test_ctx;
    use crate::sim::scheduleables::transfer_manager::BaseTransferManager;

    struct Setup {
        ctx: Ctx,
        rucio: Rc<Rucio>,
        src: StorageElementRef,
        dst: StorageElementRef,
        gen: Rc<JobSlotTransferGen>,
        mgr: Rc<FixedTimeTransferManager>,
    }

    fn setup(num_max_slots: u32) -> Setup {
        let ctx = test_ctx();
        let rucio = Rucio::new(Rc::clone(&ctx));
        let site = rucio.create_grid_site("site".into(), "eu".into(), 0);
        let src = site.create_storage_element(
            &ctx,
            "src".into(),
            false,
            0,
            ValueGen::fixed(0.0),
            None,
        );
        let dst = site.create_storage_element(
            &ctx,
            "dst".into(),
            false,
            0,
            ValueGen::fixed(0.0),
            None,
        );
        src.create_network_link(&ctx, &dst, 1 << 30);

        let mgr = FixedTimeTransferManager::new(Rc::clone(&ctx), "mgr", 1, 0);
        let mut priorities = HashMap::new();
        priorities.insert(src.id(), 0);
        let gen = JobSlotTransferGen::new(
            Rc::clone(&ctx),
            "JobSlot",
            Rc::clone(&rucio),
            Rc::clone(&mgr),
            priorities,
            vec![JobSlotInfo::new(Rc::clone(&dst), num_max_slots)],
            60,
            0,
        );
        Setup {
            ctx,
            rucio,
            src,
            dst,
            gen,
            mgr,
        }
    }

    fn add_src_file(setup: &Setup) -> crate::infrastructure::FileRef {
        let file = setup.rucio.create_file(1 << 20, 0, 1_000_000);
        let replica = setup.src.create_replica(&setup.ctx, &file, 0).unwrap();
        replica.increase(1 << 20, 0);
        file
    }

    #[test]
    fn starts_transfers_and_holds_slots() {
        let setup = setup(100);
        for _ in 0..8 {
            add_src_file(&setup);
        }

        setup.gen.on_update(0);
        // flex limit: min(free, 1 + 1% of 100) = 2
        let started = setup.mgr.num_queued() + setup.mgr.num_active();
        assert!(started <= 2);
        assert_eq!(setup.gen.dst_infos()[0].used_slots(), started as u32);
        assert_eq!(setup.dst.num_replicas(), started);

        // slots stay held before now + 900
        setup.gen.on_update(60);
        let after = setup.gen.dst_infos()[0].used_slots();
        assert!(after >= started as u32);

        // past the hold the first batch is reclaimed
        setup.gen.on_update(1000);
        let schedule = setup.gen.dst_infos()[0].schedule.borrow();
        assert!(schedule.iter().all(|(finish, _)| *finish > 1000));
    }

    #[test]
    fn no_files_means_no_transfers() {
        let setup = setup(100);
        setup.gen.on_update(0);
        assert_eq!(setup.mgr.num_queued() + setup.mgr.num_active(), 0);
        assert_eq!(setup.gen.dst_infos()[0].used_slots(), 0);
    }

    #[test]
    fn unprioritised_sources_are_not_used() {
        let setup = setup(100);
        let file = setup.rucio.create_file(1 << 20, 0, 1_000_000);
        let site = setup.rucio.grid_sites()[0].clone();
        let other = site.create_storage_element(
            &setup.ctx,
            "other".into(),
            false,
            0,
            ValueGen::fixed(0.0),
            None,
        );
        other.create_network_link(&setup.ctx, &setup.dst, 1 << 30);
        let replica = other.create_replica(&setup.ctx, &file, 0).unwrap();
        replica.increase(1 << 20, 0);

        setup.gen.on_update(0);
        assert_eq!(setup.mgr.num_queued() + setup.mgr.num_active(), 0);
        // the speculative destination replica was rolled back
        assert_eq!(setup.dst.num_replicas(), 0);
    }
}
