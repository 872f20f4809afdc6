//! Cache-aware source selection with access-count decay.
//!
//! Files are kept in bins by how often they have been transferred: bin 0
//! holds files seen once, bin 1 files seen twice, and so on. Each bin
//! contributes a configured share of the day's transfers, so the more often
//! a file was used the less likely it is to be picked again. A transfer
//! prefers a cache replica as source; on a miss the file is additionally
//! copied into the cache (unless it sits in the last bin and is unlikely to
//! be needed again), evicting the oldest cached replica when the cache is
//! full.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::common::{Ctx, Tick, SECONDS_PER_DAY};
use crate::infrastructure::{
    File, FileListener, FileRef, ReplicaRef, Rucio, StorageElement, StorageElementRef,
};
use crate::sim::scheduleables::FixedTimeTransferManager;
use crate::sim::{SchedState, Schedulable};

/// Every cache-driven transfer runs over a fixed 60 tick window.
const TRANSFER_DURATION: Tick = 60;
/// Retries when a randomly picked file is unusable for the destination.
const FILE_PICK_RETRIES: usize = 10;

/// A storage element acting as cache, with its capacity in replicas and the
/// lifetime given to replicas staged into it.
pub struct CacheElement {
    pub element: StorageElementRef,
    pub max_replicas: usize,
    pub default_replica_lifetime: Tick,
}

struct Bin {
    ratio: f32,
    files: Vec<Weak<File>>,
}

pub struct CachedSrcTransferGen {
    sched: SchedState,
    ctx: Ctx,
    rucio: Rc<Rucio>,
    mgr: Rc<FixedTimeTransferManager>,
    tick_freq: Tick,
    num_per_day: u64,
    default_replica_lifetime: Tick,
    src_elements: Vec<StorageElementRef>,
    cache_elements: Vec<CacheElement>,
    dst_elements: Vec<StorageElementRef>,
    bins: RefCell<Vec<Bin>>,
}

impl CachedSrcTransferGen {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Ctx,
        name: impl Into<String>,
        rucio: Rc<Rucio>,
        mgr: Rc<FixedTimeTransferManager>,
        num_per_day: u64,
        default_replica_lifetime: Tick,
        src_elements: Vec<StorageElementRef>,
        cache_elements: Vec<CacheElement>,
        dst_elements: Vec<StorageElementRef>,
        access_count_ratios: Option<Vec<f32>>,
        tick_freq: Tick,
        start_tick: Tick,
    ) -> Rc<Self> {
        let ratios = access_count_ratios.unwrap_or_else(|| vec![0.62, 0.16, 0.08, 0.05]);
        Rc::new(CachedSrcTransferGen {
            sched: SchedState::new(name, start_tick),
            ctx,
            rucio,
            mgr,
            tick_freq,
            num_per_day,
            default_replica_lifetime,
            src_elements,
            cache_elements,
            dst_elements,
            bins: RefCell::new(
                ratios
                    .into_iter()
                    .map(|ratio| Bin {
                        ratio,
                        files: Vec::new(),
                    })
                    .collect(),
            ),
        })
    }

    /// Registers this generator for new files; they start in bin 0.
    pub fn register_listeners(self: &Rc<Self>) {
        let listener: Rc<dyn FileListener> = Rc::clone(self) as _;
        self.rucio.add_file_listener(Rc::downgrade(&listener));
    }

    pub fn num_files_in_bin(&self, bin: usize) -> usize {
        self.bins.borrow()[bin]
            .files
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    fn cache_replica_of(&self, file: &FileRef) -> Option<ReplicaRef> {
        for cache in &self.cache_elements {
            if let Some(replica) = file.replica_at(&cache.element) {
                return Some(replica);
            }
        }
        None
    }

    /// Expires the oldest replica of a full cache and removes it. Large
    /// caches are sampled (5%) instead of scanned.
    fn evict_oldest(&self, cache: &StorageElement, now: Tick) {
        let replicas = cache.replicas();
        if replicas.is_empty() {
            return;
        }
        let oldest = if replicas.len() as u64 / self.tick_freq.max(1) >= 50 {
            let num_samples = ((replicas.len() as f64 * 0.05) as usize).max(1);
            let mut rng = self.ctx.rng.borrow_mut();
            (0..num_samples)
                .map(|_| {
                    let idx = rand::Rng::gen_range(&mut *rng, 0..replicas.len());
                    Rc::clone(&replicas[idx])
                })
                .min_by_key(|replica| replica.expires_at())
        } else {
            replicas
                .iter()
                .min_by_key(|replica| replica.expires_at())
                .map(Rc::clone)
        };
        if let Some(oldest) = oldest {
            oldest.set_expires_at(now);
            let file = Rc::clone(oldest.file());
            drop(oldest);
            self.rucio.remove_expired_replicas_from_file(&file, now);
        }
    }

    /// Picks a random live file from the bin that is usable for `dst`:
    /// not already present there and still holding replicas. Dead weak
    /// entries found on the way are pruned.
    fn pick_file(&self, bin_idx: usize, dst: &StorageElement) -> Option<FileRef> {
        let mut bins = self.bins.borrow_mut();
        let files = &mut bins[bin_idx].files;
        for _ in 0..FILE_PICK_RETRIES {
            if files.is_empty() {
                return None;
            }
            let idx = {
                let mut rng = self.ctx.rng.borrow_mut();
                rand::Rng::gen_range(&mut *rng, 0..files.len())
            };
            match files[idx].upgrade() {
                Some(file) => {
                    if file.replicas().is_empty() || file.replica_at(dst).is_some() {
                        continue;
                    }
                    files.swap_remove(idx);
                    return Some(file);
                }
                None => {
                    files.swap_remove(idx);
                }
            }
        }
        None
    }

    /// Cheapest complete source replica outside the caches.
    fn best_src_replica(&self, file: &FileRef) -> Option<ReplicaRef> {
        file.replicas()
            .into_iter()
            .find(|replica| replica.is_complete())
    }

    fn move_to_next_bin(&self, bin_idx: usize, file: &FileRef) {
        let mut bins = self.bins.borrow_mut();
        if bin_idx + 1 < bins.len() {
            bins[bin_idx + 1].files.push(Rc::downgrade(file));
        }
    }

    /// Puts a picked but unused file back into its bin.
    fn return_to_bin(&self, bin_idx: usize, file: &FileRef) {
        self.bins.borrow_mut()[bin_idx].files.push(Rc::downgrade(file));
    }
}

impl FileListener for CachedSrcTransferGen {
    fn post_create_file(&self, file: &FileRef, _now: Tick) {
        self.bins.borrow_mut()[0].files.push(Rc::downgrade(file));
    }
}

impl Schedulable for CachedSrcTransferGen {
    fn sched(&self) -> &SchedState {
        &self.sched
    }

    fn on_update(&self, now: Tick) {
        let per_update = (self.num_per_day * self.tick_freq) as f64 / SECONDS_PER_DAY as f64;
        let num_bins = self.bins.borrow().len();

        // most-accessed bins first, as their files are about to leave the
        // working set
        for bin_idx in (0..num_bins).rev() {
            let (ratio, is_empty) = {
                let bins = self.bins.borrow();
                (bins[bin_idx].ratio, bins[bin_idx].files.is_empty())
            };
            if is_empty {
                continue;
            }
            let num_to_create = 1 + (per_update * ratio as f64) as usize;
            let last_bin = bin_idx == num_bins - 1;

            for dst in &self.dst_elements {
                for _ in 0..num_to_create {
                    let file = match self.pick_file(bin_idx, dst) {
                        Some(file) => file,
                        None => break,
                    };

                    let src_replica = match self.cache_replica_of(&file) {
                        Some(cached) if cached.is_complete() => cached,
                        // still on its way into the cache
                        Some(_) => {
                            self.return_to_bin(bin_idx, &file);
                            continue;
                        }
                        None => {
                            let best = match self.best_src_replica(&file) {
                                Some(best) => best,
                                None => {
                                    self.return_to_bin(bin_idx, &file);
                                    continue;
                                }
                            };
                            if !self.cache_elements.is_empty() && !last_bin {
                                let cache = &self.cache_elements[0];
                                if cache.element.num_replicas() >= cache.max_replicas {
                                    self.evict_oldest(&cache.element, now);
                                }
                                if let Some(cache_replica) =
                                    cache.element.create_replica(&self.ctx, &file, now)
                                {
                                    cache_replica
                                        .set_expires_at(now + cache.default_replica_lifetime);
                                    self.mgr.create_transfer(
                                        &best,
                                        &cache_replica,
                                        now,
                                        0,
                                        TRANSFER_DURATION,
                                    );
                                }
                            }
                            best
                        }
                    };

                    let new_replica = match dst.create_replica(&self.ctx, &file, now) {
                        Some(replica) => replica,
                        None => {
                            self.return_to_bin(bin_idx, &file);
                            continue;
                        }
                    };
                    new_replica.set_expires_at(now + self.default_replica_lifetime);
                    self.mgr
                        .create_transfer(&src_replica, &new_replica, now, 0, TRANSFER_DURATION);

                    self.move_to_next_bin(bin_idx, &file);
                }
            }
        }

        self.sched.reschedule_at(now + self.tick_freq);
    }
}
