//! Primary-buffer spillover policy.
//!
//! Completed replicas appearing on a configured source element are queued
//! for transfer towards a primary destination (typically local disk). When
//! the primary cannot take another copy, the transfer falls back to a
//! secondary destination (typically a cloud bucket acting as buffer); when
//! both are unavailable the replica stays queued for a later tick.

use std::cell::RefCell;
use std::rc::Rc;

use crate::common::random::ValueGen;
use crate::common::{Ctx, Tick};
use crate::infrastructure::{
    NetworkLinkRef, ReplicaRef, StorageElementListener,
};
use crate::sim::scheduleables::TransferManager;
use crate::sim::{SchedState, Schedulable};

/// Source-to-destination wiring of one spillover lane.
pub struct CloudBufferInfo {
    pub reusage_num_gen: ValueGen,
    pub primary_link: NetworkLinkRef,
    pub secondary_link: Option<NetworkLinkRef>,
    /// Pending source replicas, most popular first.
    replicas: RefCell<Vec<ReplicaRef>>,
}

impl CloudBufferInfo {
    pub fn new(
        reusage_num_gen: ValueGen,
        primary_link: NetworkLinkRef,
        secondary_link: Option<NetworkLinkRef>,
    ) -> CloudBufferInfo {
        CloudBufferInfo {
            reusage_num_gen,
            primary_link,
            secondary_link,
            replicas: RefCell::new(Vec::new()),
        }
    }

    pub fn num_pending(&self) -> usize {
        self.replicas.borrow().len()
    }
}

pub struct CloudBufferTransferGen {
    sched: SchedState,
    ctx: Ctx,
    mgr: Rc<TransferManager>,
    tick_freq: Tick,
    infos: Vec<CloudBufferInfo>,
    pub delete_src_replica: bool,
}

impl CloudBufferTransferGen {
    pub fn new(
        ctx: Ctx,
        name: impl Into<String>,
        mgr: Rc<TransferManager>,
        infos: Vec<CloudBufferInfo>,
        delete_src_replica: bool,
        tick_freq: Tick,
        start_tick: Tick,
    ) -> Rc<Self> {
        assert!(!infos.is_empty(), "cloud buffer generator needs lanes");
        Rc::new(CloudBufferTransferGen {
            sched: SchedState::new(name, start_tick),
            ctx,
            mgr,
            tick_freq,
            infos,
            delete_src_replica,
        })
    }

    /// Registers this generator on the source elements so new replicas
    /// enter the pending lists.
    pub fn register_listeners(self: &Rc<Self>) {
        let listener: Rc<dyn StorageElementListener> = Rc::clone(self) as _;
        for info in &self.infos {
            info.primary_link.src().add_listener(Rc::downgrade(&listener));
        }
    }
}

impl StorageElementListener for CloudBufferTransferGen {
    fn post_create_replica(&self, replica: &ReplicaRef, _now: Tick) {
        for info in &self.infos {
            if replica.storage_element_id() != info.primary_link.src().id() {
                continue;
            }
            let num_reusages = {
                let mut rng = self.ctx.rng.borrow_mut();
                info.reusage_num_gen.sample_count(&mut *rng) as u32
            };
            replica.file().set_popularity(num_reusages);

            // keep most popular first so they reach the primary while it
            // still has room
            let mut replicas = info.replicas.borrow_mut();
            let pos = replicas
                .iter()
                .position(|queued| queued.file().popularity() < num_reusages)
                .unwrap_or(replicas.len());
            replicas.insert(pos, Rc::clone(replica));
            return;
        }
    }

    fn pre_remove_replica(&self, replica: &ReplicaRef, _now: Tick) {
        for info in &self.infos {
            info.replicas
                .borrow_mut()
                .retain(|queued| queued.id() != replica.id());
        }
    }
}

impl Schedulable for CloudBufferTransferGen {
    fn sched(&self) -> &SchedState {
        &self.sched
    }

    fn on_update(&self, now: Tick) {
        for info in &self.infos {
            loop {
                if !info.primary_link.has_free_slot() {
                    break;
                }
                // take the best complete pending replica; incomplete ones
                // are still being written and stay for a later tick
                let src_replica = {
                    let replicas = info.replicas.borrow();
                    match replicas.iter().find(|replica| replica.is_complete()) {
                        Some(replica) => Rc::clone(replica),
                        None => break,
                    }
                };

                let file = Rc::clone(src_replica.file());
                let mut new_replica =
                    info.primary_link.dst().create_replica(&self.ctx, &file, now);
                if new_replica.is_none() {
                    if let Some(secondary) = &info.secondary_link {
                        if secondary.has_free_slot() {
                            new_replica = secondary.dst().create_replica(&self.ctx, &file, now);
                        }
                    }
                }

                match new_replica {
                    Some(dst_replica) => {
                        self.mgr.create_transfer(
                            &src_replica,
                            &dst_replica,
                            now,
                            self.delete_src_replica,
                        );
                        info.replicas
                            .borrow_mut()
                            .retain(|queued| queued.id() != src_replica.id());
                    }
                    // neither destination can host the copy right now
                    None => break,
                }
            }
        }

        self.sched.reschedule_at(now + self.tick_freq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::testutil::test_ctx;
    use crate::infrastructure::Rucio;
    use crate::sim::scheduleables::transfer_manager::BaseTransferManager;

    /// Spillover: primary holds two 512 MiB replicas, the third goes to the
    /// secondary.
    #[test]
    fn spills_to_secondary_when_primary_is_full() {
        let ctx = test_ctx();
        let rucio = Rucio::new(Rc::clone(&ctx));
        let site = rucio.create_grid_site("site".into(), "eu".into(), 0);
        let src =
            site.create_storage_element(&ctx, "src".into(), true, 0, ValueGen::fixed(0.0), None);
        let gib = 1u64 << 30;
        let primary =
            site.create_storage_element(&ctx, "primary".into(), true, gib, ValueGen::fixed(0.0), None);
        let secondary = site.create_storage_element(
            &ctx,
            "secondary".into(),
            true,
            100 * gib,
            ValueGen::fixed(0.0),
            None,
        );
        let primary_link = src.create_network_link(&ctx, &primary, gib);
        primary_link.set_max_num_active_transfers(10);
        let secondary_link = src.create_network_link(&ctx, &secondary, gib);
        secondary_link.set_max_num_active_transfers(10);

        let mgr = TransferManager::new(Rc::clone(&ctx), "mgr", 1, 0);
        let gen = CloudBufferTransferGen::new(
            Rc::clone(&ctx),
            "Buffer",
            Rc::clone(&mgr),
            vec![CloudBufferInfo::new(
                ValueGen::fixed(3.0),
                Rc::clone(&primary_link),
                Some(Rc::clone(&secondary_link)),
            )],
            false,
            10,
            0,
        );
        gen.register_listeners();

        let half_gib = gib / 2;
        for _ in 0..3 {
            let file = rucio.create_file(half_gib, 0, 100_000);
            let replica = src.create_replica(&ctx, &file, 0).unwrap();
            replica.increase(half_gib, 0);
        }
        assert_eq!(gen.infos[0].num_pending(), 3);

        gen.on_update(0);
        assert_eq!(primary.num_replicas(), 2);
        assert_eq!(secondary.num_replicas(), 1);
        assert_eq!(mgr.num_queued(), 3);
        assert_eq!(gen.infos[0].num_pending(), 0);
    }

    #[test]
    fn popularity_orders_the_pending_queue() {
        let ctx = test_ctx();
        let rucio = Rucio::new(Rc::clone(&ctx));
        let site = rucio.create_grid_site("site".into(), "eu".into(), 0);
        let src =
            site.create_storage_element(&ctx, "src".into(), true, 0, ValueGen::fixed(0.0), None);
        let dst =
            site.create_storage_element(&ctx, "dst".into(), true, 0, ValueGen::fixed(0.0), None);
        let link = src.create_network_link(&ctx, &dst, 1000);
        link.set_max_num_active_transfers(10);

        let mgr = TransferManager::new(Rc::clone(&ctx), "mgr", 1, 0);
        // geometric reusage numbers vary per replica
        let gen = CloudBufferTransferGen::new(
            Rc::clone(&ctx),
            "Buffer",
            mgr,
            vec![CloudBufferInfo::new(
                ValueGen::from_cfg(&crate::common::random::ValueGenCfg::Geometric {
                    p: 0.3,
                    min_cfg: None,
                    max_cfg: None,
                })
                .unwrap(),
                Rc::clone(&link),
                None,
            )],
            false,
            10,
            0,
        );
        gen.register_listeners();

        for _ in 0..16 {
            let file = rucio.create_file(10, 0, 100_000);
            src.create_replica(&ctx, &file, 0).unwrap();
        }

        let pending = gen.infos[0].replicas.borrow();
        let popularity: Vec<u32> = pending
            .iter()
            .map(|replica| replica.file().popularity())
            .collect();
        let mut sorted = popularity.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(popularity, sorted);
    }
}
