//! Hot/cold/archive tiering for derivation workflows.
//!
//! All input data rests on an archive element. Before production starts,
//! popular files are pre-staged into cold storage. During production, jobs
//! are submitted against popularity-weighted inputs: a job waits until its
//! input is on hot storage (staged from cold when possible, from the
//! archive otherwise), downloads it to a worker, runs for a sampled
//! duration and uploads its outputs. Once every planned use of a hot
//! replica has been consumed it is drained back to cold storage and removed
//! from hot; the drain is deferred while cold has no room.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use crate::common::random::ValueGen;
use crate::common::{Ctx, Id, Space, Tick, SECONDS_PER_MONTH};
use crate::infrastructure::{
    File, FileRef, NetworkLinkRef, ReplicaRef, Rucio, StorageElementListener, StorageElementRef,
};
use crate::output::{PreparedInsert, ValuesContainer};
use crate::sim::scheduleables::generators::job_io::{TRACES_INSERT, TRACE_READ, TRACE_WRITE};
use crate::sim::scheduleables::TransferManager;
use crate::sim::{SchedState, Schedulable};

/// Lifetime of job output files.
const OUTPUT_FILE_LIFETIME: Tick = 6 * SECONDS_PER_MONTH;
/// Retries when sampling an input or pre-staging candidate.
const SAMPLE_RETRIES: usize = 10;
/// Fallback pre-staging budget for links without a transfer cap.
const DEFAULT_PREPARE_BUDGET: u32 = 10;

struct Job {
    id: Id,
    input_file: FileRef,
    hot_replica: Option<ReplicaRef>,
    cur_input_size: Space,
    started_at: Tick,
    finished_at: Tick,
    output_replicas: Vec<ReplicaRef>,
}

impl Job {
    fn new(id: Id, input_file: FileRef, now: Tick) -> Job {
        Job {
            id,
            input_file,
            hot_replica: None,
            cur_input_size: 0,
            started_at: now,
            finished_at: now,
            output_replicas: Vec::new(),
        }
    }
}

#[derive(Default)]
struct HcdcState {
    /// Archive files grouped by popularity, the base of every weighted
    /// draw.
    archive_files_by_popularity: BTreeMap<u32, Vec<Weak<File>>>,
    /// Hot replicas whose drain to cold is due at the key tick.
    pending_deletions: BTreeMap<Tick, Vec<ReplicaRef>>,
    waiting: Vec<Job>,
    /// Jobs waiting for a hot replica of the same file to finish staging.
    waiting_for_same_file: HashMap<Id, Vec<Job>>,
    queued: Vec<Job>,
    downloading: Vec<Job>,
    running: BTreeMap<Tick, Vec<Job>>,
    uploading: Vec<Job>,
    num_active_jobs: usize,
    submission_accu: f64,
}

pub struct HcdcTransferGen {
    sched: SchedState,
    ctx: Ctx,
    rucio: Rc<Rucio>,
    mgr: Rc<TransferManager>,
    tick_freq: Tick,
    last_update: std::cell::Cell<Tick>,

    pub archive: StorageElementRef,
    pub cold: StorageElementRef,
    pub hot: StorageElementRef,
    archive_to_hot: NetworkLinkRef,
    archive_to_cold: NetworkLinkRef,
    hot_to_cpu: NetworkLinkRef,
    cpu_to_output: NetworkLinkRef,

    production_start_time: Tick,
    num_cores: usize,
    reusage_num_gen: ValueGen,
    num_job_submission_gen: ValueGen,
    job_duration_gen: ValueGen,
    num_output_gen: ValueGen,
    output_size_gen: ValueGen,

    state: RefCell<HcdcState>,
    trace_insert: Rc<PreparedInsert>,
}

impl HcdcTransferGen {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Ctx,
        name: impl Into<String>,
        rucio: Rc<Rucio>,
        mgr: Rc<TransferManager>,
        archive: StorageElementRef,
        cold: StorageElementRef,
        hot: StorageElementRef,
        archive_to_hot: NetworkLinkRef,
        archive_to_cold: NetworkLinkRef,
        hot_to_cpu: NetworkLinkRef,
        cpu_to_output: NetworkLinkRef,
        production_start_time: Tick,
        num_cores: usize,
        reusage_num_gen: ValueGen,
        num_job_submission_gen: ValueGen,
        job_duration_gen: ValueGen,
        num_output_gen: ValueGen,
        output_size_gen: ValueGen,
        tick_freq: Tick,
        start_tick: Tick,
    ) -> Rc<Self> {
        let trace_insert = ctx.output.borrow().prepare_insert(TRACES_INSERT, 9, '?');
        Rc::new(HcdcTransferGen {
            sched: SchedState::new(name, start_tick),
            ctx,
            rucio,
            mgr,
            tick_freq,
            last_update: std::cell::Cell::new(start_tick),
            archive,
            cold,
            hot,
            archive_to_hot,
            archive_to_cold,
            hot_to_cpu,
            cpu_to_output,
            production_start_time,
            num_cores,
            reusage_num_gen,
            num_job_submission_gen,
            job_duration_gen,
            num_output_gen,
            output_size_gen,
            state: RefCell::new(HcdcState::default()),
            trace_insert,
        })
    }

    /// Registers on the archive (new files receive their popularity) and on
    /// hot storage (completed stagings wake waiting jobs).
    pub fn register_listeners(self: &Rc<Self>) {
        let listener: Rc<dyn StorageElementListener> = Rc::clone(self) as _;
        self.archive.add_listener(Rc::downgrade(&listener));
        self.hot.add_listener(Rc::downgrade(&listener));
    }

    pub fn num_jobs(&self) -> usize {
        let state = self.state.borrow();
        state.waiting.len()
            + state
                .waiting_for_same_file
                .values()
                .map(Vec::len)
                .sum::<usize>()
            + state.queued.len()
            + state.num_active_jobs
    }

    /// Draws an archive file weighted by popularity. Dead entries are
    /// pruned on the way.
    fn sample_input_file(&self) -> Option<FileRef> {
        let mut state = self.state.borrow_mut();
        let files = &mut state.archive_files_by_popularity;
        files.retain(|_, bucket| {
            bucket.retain(|weak| weak.strong_count() > 0);
            !bucket.is_empty()
        });

        let total_weight: u64 = files
            .iter()
            .map(|(popularity, bucket)| *popularity as u64 * bucket.len() as u64)
            .sum();
        if total_weight == 0 {
            return None;
        }
        let mut point = {
            let mut rng = self.ctx.rng.borrow_mut();
            rand::Rng::gen_range(&mut *rng, 0..total_weight)
        };
        for (popularity, bucket) in files.iter() {
            let bucket_weight = *popularity as u64 * bucket.len() as u64;
            if point < bucket_weight {
                let idx = (point / (*popularity).max(1) as u64) as usize;
                return bucket[idx.min(bucket.len() - 1)].upgrade();
            }
            point -= bucket_weight;
        }
        None
    }

    /// Pre-production: move popular archive files into cold storage while
    /// the archive-to-cold link has room.
    fn prepare_production(&self, now: Tick) {
        let budget = if self.archive_to_cold.max_num_active_transfers() > 0 {
            self.archive_to_cold
                .max_num_active_transfers()
                .saturating_sub(self.archive_to_cold.num_active())
        } else {
            DEFAULT_PREPARE_BUDGET
        };

        for _ in 0..budget {
            let mut staged = false;
            for _ in 0..SAMPLE_RETRIES {
                let file = match self.sample_input_file() {
                    Some(file) => file,
                    None => return,
                };
                if file.replica_at(&self.cold).is_some() {
                    continue;
                }
                let archive_replica = match file.replica_at(&self.archive) {
                    Some(replica) if replica.is_complete() => replica,
                    _ => continue,
                };
                if let Some(cold_replica) = self.cold.create_replica(&self.ctx, &file, now) {
                    self.mgr
                        .create_transfer(&archive_replica, &cold_replica, now, false);
                    staged = true;
                }
                break;
            }
            if !staged {
                break;
            }
        }
    }

    fn submit_new_jobs(&self, now: Tick) {
        let num_to_submit = {
            let sampled = {
                let mut rng = self.ctx.rng.borrow_mut();
                self.num_job_submission_gen.sample(&mut *rng).max(0.0)
            };
            let mut state = self.state.borrow_mut();
            let total = sampled + state.submission_accu;
            let whole = total.floor();
            state.submission_accu = total - whole;
            whole as usize
        };

        for _ in 0..num_to_submit {
            let file = match self.sample_input_file() {
                Some(file) => file,
                None => break,
            };
            let job = Job::new(self.ctx.ids.next(), file, now);
            self.state.borrow_mut().waiting.push(job);
        }
    }

    /// Waiting jobs try to find (or stage) their input on hot storage.
    fn update_waiting_jobs(&self, now: Tick) {
        let waiting = std::mem::take(&mut self.state.borrow_mut().waiting);
        for mut job in waiting {
            let file = Rc::clone(&job.input_file);
            match file.replica_at(&self.hot) {
                Some(hot_replica) if hot_replica.is_complete() => {
                    job.hot_replica = Some(hot_replica);
                    self.state.borrow_mut().queued.push(job);
                }
                Some(_) => {
                    // staging already underway, join the waiters
                    self.state
                        .borrow_mut()
                        .waiting_for_same_file
                        .entry(file.id())
                        .or_default()
                        .push(job);
                }
                None => {
                    // prefer cold storage; the archive path is limited by
                    // its link capacity
                    let src_replica = match file.replica_at(&self.cold) {
                        Some(cold_replica) if cold_replica.is_complete() => Some(cold_replica),
                        _ => match file.replica_at(&self.archive) {
                            Some(archive_replica)
                                if archive_replica.is_complete()
                                    && self.archive_to_hot.has_free_slot() =>
                            {
                                Some(archive_replica)
                            }
                            _ => None,
                        },
                    };
                    match src_replica {
                        Some(src_replica) => {
                            match self.hot.create_replica(&self.ctx, &file, now) {
                                Some(hot_replica) => {
                                    self.mgr
                                        .create_transfer(&src_replica, &hot_replica, now, false);
                                    self.state
                                        .borrow_mut()
                                        .waiting_for_same_file
                                        .entry(file.id())
                                        .or_default()
                                        .push(job);
                                }
                                // hot storage full, retry next tick
                                None => self.state.borrow_mut().waiting.push(job),
                            }
                        }
                        // no complete source anywhere yet
                        None => self.state.borrow_mut().waiting.push(job),
                    }
                }
            }
        }
    }

    fn update_queued_jobs(&self) {
        let mut state = self.state.borrow_mut();
        while state.num_active_jobs < self.num_cores && !state.queued.is_empty() {
            let job = state.queued.remove(0);
            state.downloading.push(job);
            state.num_active_jobs += 1;
        }
    }

    fn update_downloading_jobs(&self, now: Tick, time_diff: Tick, rows: &mut ValuesContainer) {
        let hot_to_cpu = &self.hot_to_cpu;
        let download_bytes = (hot_to_cpu.bandwidth_bytes_per_second() as f64
            / (hot_to_cpu.num_active() + 1) as f64
            * time_diff as f64) as Space;

        let downloading = std::mem::take(&mut self.state.borrow_mut().downloading);
        for mut job in downloading {
            let input_size = job.input_file.size();
            if job.cur_input_size == 0 {
                job.cur_input_size = 1;
                job.started_at = now;
                hot_to_cpu.add_active(1);
            }
            let new_size = job.cur_input_size + download_bytes;
            if new_size >= input_size {
                hot_to_cpu.add_traffic(input_size - job.cur_input_size);
                hot_to_cpu.add_active(-1);
                hot_to_cpu.count_done();
                job.cur_input_size = input_size;

                let replica_id = job
                    .hot_replica
                    .as_ref()
                    .map(|replica| replica.id())
                    .unwrap_or(0);
                add_trace_row(
                    rows,
                    &self.ctx,
                    job.id,
                    self.hot.id(),
                    job.input_file.id(),
                    replica_id,
                    TRACE_READ,
                    job.started_at,
                    now,
                    input_size,
                );

                let duration = {
                    let mut rng = self.ctx.rng.borrow_mut();
                    self.job_duration_gen.sample(&mut *rng).max(0.0) as Tick
                };
                job.started_at = now;
                job.finished_at = now + duration;
                self.state
                    .borrow_mut()
                    .running
                    .entry(job.finished_at)
                    .or_default()
                    .push(job);
            } else {
                hot_to_cpu.add_traffic(download_bytes);
                job.cur_input_size = new_size;
                self.state.borrow_mut().downloading.push(job);
            }
        }
    }

    fn update_running_jobs(&self, now: Tick) {
        let due: Vec<Job> = {
            let mut state = self.state.borrow_mut();
            let due_keys: Vec<Tick> = state
                .running
                .range(..=now)
                .map(|(tick, _)| *tick)
                .collect();
            due_keys
                .into_iter()
                .flat_map(|tick| state.running.remove(&tick).unwrap_or_default())
                .collect()
        };

        for mut job in due {
            let num_outputs = {
                let mut rng = self.ctx.rng.borrow_mut();
                self.num_output_gen.sample_count(&mut *rng)
            };
            for _ in 0..num_outputs {
                let size = {
                    let mut rng = self.ctx.rng.borrow_mut();
                    (self.output_size_gen.sample(&mut *rng).max(1.0)) as Space
                };
                let output_file = self.rucio.create_file(size, now, OUTPUT_FILE_LIFETIME);
                match self
                    .cpu_to_output
                    .dst()
                    .create_replica(&self.ctx, &output_file, now)
                {
                    Some(replica) => {
                        self.cpu_to_output.add_active(1);
                        job.output_replicas.push(replica);
                    }
                    None => log::warn!("hcdc could not create output replica"),
                }
            }
            if job.output_replicas.is_empty() {
                self.finish_job(job, now);
            } else {
                self.state.borrow_mut().uploading.push(job);
            }
        }
    }

    fn update_uploading_jobs(&self, now: Tick, time_diff: Tick, rows: &mut ValuesContainer) {
        let cpu_to_output = &self.cpu_to_output;
        let upload_bytes = (cpu_to_output.bandwidth_bytes_per_second() as f64
            / (cpu_to_output.num_active() + 1) as f64
            * time_diff as f64) as Space;

        let uploading = std::mem::take(&mut self.state.borrow_mut().uploading);
        for mut job in uploading {
            let mut idx = 0;
            while idx < job.output_replicas.len() {
                let replica = Rc::clone(&job.output_replicas[idx]);
                let amount = replica.increase(upload_bytes, now);
                cpu_to_output.add_traffic(amount);
                if replica.is_complete() {
                    cpu_to_output.add_active(-1);
                    cpu_to_output.count_done();
                    add_trace_row(
                        rows,
                        &self.ctx,
                        job.id,
                        replica.storage_element_id(),
                        replica.file().id(),
                        replica.id(),
                        TRACE_WRITE,
                        job.finished_at,
                        now,
                        replica.file().size(),
                    );
                    job.output_replicas.swap_remove(idx);
                } else {
                    idx += 1;
                }
            }
            if job.output_replicas.is_empty() {
                self.finish_job(job, now);
            } else {
                self.state.borrow_mut().uploading.push(job);
            }
        }
    }

    /// Consumes one planned use of the job's hot replica; the replica is
    /// queued for its cold drain once all uses happened.
    fn finish_job(&self, job: Job, now: Tick) {
        self.state.borrow_mut().num_active_jobs -= 1;
        if let Some(hot_replica) = job.hot_replica {
            hot_replica.increment_usage();
            if hot_replica.usage_counter() >= job.input_file.popularity() {
                self.state
                    .borrow_mut()
                    .pending_deletions
                    .entry(now + self.tick_freq)
                    .or_default()
                    .push(hot_replica);
            }
        }
    }

    /// Drains due hot replicas to cold storage. A replica already on cold
    /// is dropped from hot immediately; otherwise a hot-to-cold transfer
    /// that deletes its source is started, or the drain is deferred while
    /// cold is full.
    fn update_pending_deletions(&self, now: Tick) {
        let due: Vec<ReplicaRef> = {
            let mut state = self.state.borrow_mut();
            let due_keys: Vec<Tick> = state
                .pending_deletions
                .range(..=now)
                .map(|(tick, _)| *tick)
                .collect();
            due_keys
                .into_iter()
                .flat_map(|tick| state.pending_deletions.remove(&tick).unwrap_or_default())
                .collect()
        };

        for hot_replica in due {
            if !self.hot.holds_replica(&hot_replica) {
                continue;
            }
            let file = Rc::clone(hot_replica.file());
            if file
                .replica_at(&self.cold)
                .map(|cold| cold.is_complete())
                .unwrap_or(false)
            {
                self.hot.remove_replica(&hot_replica, now, true);
                continue;
            }
            match self.cold.create_replica(&self.ctx, &file, now) {
                Some(cold_replica) => {
                    self.mgr
                        .create_transfer(&hot_replica, &cold_replica, now, true);
                }
                None => {
                    // cold full, try again later
                    self.state
                        .borrow_mut()
                        .pending_deletions
                        .entry(now + self.tick_freq)
                        .or_default()
                        .push(hot_replica);
                }
            }
        }
    }

    fn update_production(&self, now: Tick, time_diff: Tick) {
        let mut rows = self.trace_insert.values_container(9 * 16);
        self.submit_new_jobs(now);
        self.update_pending_deletions(now);
        self.update_waiting_jobs(now);
        self.update_queued_jobs();
        self.update_downloading_jobs(now, time_diff, &mut rows);
        self.update_running_jobs(now);
        self.update_uploading_jobs(now, time_diff, &mut rows);
        self.ctx.output.borrow().queue_inserts(rows);
    }
}

#[allow(clippy::too_many_arguments)]
fn add_trace_row(
    rows: &mut ValuesContainer,
    ctx: &Ctx,
    job_id: Id,
    storage_element_id: Id,
    file_id: Id,
    replica_id: Id,
    kind: u32,
    started_at: Tick,
    finished_at: Tick,
    traffic: Space,
) {
    rows.add_value(ctx.ids.next());
    rows.add_value(job_id);
    rows.add_value(storage_element_id);
    rows.add_value(file_id);
    rows.add_value(replica_id);
    rows.add_value(kind);
    rows.add_value(started_at);
    rows.add_value(finished_at);
    rows.add_value(traffic);
}

impl StorageElementListener for HcdcTransferGen {
    fn post_create_replica(&self, replica: &ReplicaRef, _now: Tick) {
        if replica.storage_element_id() != self.archive.id() {
            return;
        }
        let popularity = {
            let mut rng = self.ctx.rng.borrow_mut();
            self.reusage_num_gen.sample_count(&mut *rng) as u32
        };
        let file = replica.file();
        file.set_popularity(popularity);
        self.state
            .borrow_mut()
            .archive_files_by_popularity
            .entry(file.popularity())
            .or_default()
            .push(Rc::downgrade(file));
    }

    fn post_complete_replica(&self, replica: &ReplicaRef, _now: Tick) {
        if replica.storage_element_id() != self.hot.id() {
            return;
        }
        // the staging transfer finished: release everyone waiting on it
        let mut state = self.state.borrow_mut();
        if let Some(mut waiters) = state
            .waiting_for_same_file
            .remove(&replica.file().id())
        {
            for job in waiters.iter_mut() {
                job.hot_replica = Some(Rc::clone(replica));
            }
            state.queued.extend(waiters);
        }
    }

    fn pre_remove_replica(&self, replica: &ReplicaRef, _now: Tick) {
        if replica.storage_element_id() != self.hot.id() {
            return;
        }
        // a dying staging replica sends its waiters back to the start
        let mut state = self.state.borrow_mut();
        if let Some(waiters) = state.waiting_for_same_file.remove(&replica.file().id()) {
            state.waiting.extend(waiters);
        }
    }
}

impl Schedulable for HcdcTransferGen {
    fn sched(&self) -> &SchedState {
        &self.sched
    }

    fn on_update(&self, now: Tick) {
        let time_diff = now - self.last_update.get();
        self.last_update.set(now);

        if now < self.production_start_time {
            self.prepare_production(now);
        } else {
            self.update_production(now, time_diff);
        }

        self.sched.reschedule_at(now + self.tick_freq);
    }

    fn shutdown(&self, _now: Tick) {
        let state = self.state.borrow();
        log::info!(
            "{}: shutdown with {} waiting / {} queued / {} active jobs, {} drains pending",
            self.sched.name(),
            state.waiting.len(),
            state.queued.len(),
            state.num_active_jobs,
            state
                .pending_deletions
                .values()
                .map(Vec::len)
                .sum::<usize>()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::testutil::test_ctx;
    use crate::sim::scheduleables::transfer_manager::BaseTransferManager;

    struct Setup {
        ctx: Ctx,
        rucio: Rc<Rucio>,
        cold: StorageElementRef,
        hot: StorageElementRef,
        output: StorageElementRef,
        archive: StorageElementRef,
        mgr: Rc<TransferManager>,
        gen: Rc<HcdcTransferGen>,
    }

    fn setup(production_start_time: Tick, cold_limit: Space, submissions_per_tick: f64) -> Setup {
        let ctx = test_ctx();
        let rucio = Rucio::new(Rc::clone(&ctx));
        let site = rucio.create_grid_site("site".into(), "eu".into(), 0);
        let mk = |name: &str, limit: Space| {
            site.create_storage_element(
                &ctx,
                name.into(),
                false,
                limit,
                ValueGen::fixed(0.0),
                None,
            )
        };
        let archive = mk("archive", 0);
        let cold = mk("cold", cold_limit);
        let hot = mk("hot", 0);
        let cpu = mk("cpu", 0);
        let output = mk("output", 0);

        let gib = 1u64 << 30;
        let archive_to_hot = archive.create_network_link(&ctx, &hot, gib);
        let archive_to_cold = archive.create_network_link(&ctx, &cold, gib);
        archive_to_cold.set_max_num_active_transfers(4);
        let hot_to_cpu = hot.create_network_link(&ctx, &cpu, gib);
        let cpu_to_output = cpu.create_network_link(&ctx, &output, gib);
        let cold_to_hot = cold.create_network_link(&ctx, &hot, gib);
        let hot_to_cold = hot.create_network_link(&ctx, &cold, gib);
        let _ = (cold_to_hot, hot_to_cold);

        let mgr = TransferManager::new(Rc::clone(&ctx), "mgr", 1, 0);
        let gen = HcdcTransferGen::new(
            Rc::clone(&ctx),
            "HCDC",
            Rc::clone(&rucio),
            Rc::clone(&mgr),
            Rc::clone(&archive),
            Rc::clone(&cold),
            Rc::clone(&hot),
            archive_to_hot,
            archive_to_cold,
            hot_to_cpu,
            cpu_to_output,
            production_start_time,
            4,
            ValueGen::fixed(1.0),
            ValueGen::fixed(submissions_per_tick),
            ValueGen::fixed(10.0),
            ValueGen::fixed(1.0),
            ValueGen::fixed(1024.0),
            1,
            0,
        );
        gen.register_listeners();
        Setup {
            ctx,
            rucio,
            cold,
            hot,
            output,
            archive,
            mgr,
            gen,
        }
    }

    fn add_archive_file(setup: &Setup, size: Space) -> FileRef {
        let file = setup.rucio.create_file(size, 0, 10_000_000);
        let replica = setup.archive.create_replica(&setup.ctx, &file, 0).unwrap();
        replica.increase(size, 0);
        file
    }

    #[test]
    fn archive_files_receive_popularity_on_creation() {
        let setup = setup(1000, 0, 1.0);
        let file = add_archive_file(&setup, 1024);
        assert_eq!(file.popularity(), 1);
        let state = setup.gen.state.borrow();
        assert_eq!(state.archive_files_by_popularity.len(), 1);
    }

    #[test]
    fn preparation_phase_stages_into_cold() {
        let setup = setup(1000, 0, 1.0);
        for _ in 0..3 {
            add_archive_file(&setup, 1024);
        }
        setup.gen.on_update(0);
        assert!(setup.cold.num_replicas() > 0);
        assert!(setup.mgr.num_queued() + setup.mgr.num_active() > 0);
        assert_eq!(setup.gen.num_jobs(), 0);
    }

    #[test]
    fn job_pipeline_stages_hot_runs_and_uploads() {
        let setup = setup(0, 0, 0.0);
        let file = add_archive_file(&setup, 1024);
        setup
            .gen
            .state
            .borrow_mut()
            .waiting
            .push(Job::new(setup.ctx.ids.next(), Rc::clone(&file), 0));

        // the waiting job stages its input onto hot storage
        setup.gen.on_update(0);
        assert_eq!(setup.gen.num_jobs(), 1);
        assert_eq!(setup.hot.num_replicas(), 1);

        // the staging transfer completes within one manager tick and wakes
        // the waiter
        setup.mgr.on_update(1);
        assert_eq!(setup.gen.state.borrow().queued.len(), 1);

        // tick 1: activate and download (1 KiB at 1 GiB/s), then run for 10
        // ticks
        setup.gen.on_update(1);
        for now in 2..=10 {
            setup.gen.on_update(now);
        }
        assert_eq!(setup.output.num_replicas(), 0);

        // tick 11: payload done, output created and uploaded, job finished
        setup.gen.on_update(11);
        assert_eq!(setup.output.num_replicas(), 1);
        assert_eq!(setup.gen.num_jobs(), 0);
        {
            let state = setup.gen.state.borrow();
            let pending: usize = state.pending_deletions.values().map(Vec::len).sum();
            assert_eq!(pending, 1);
        }

        // next tick drains the hot replica towards cold storage
        setup.gen.on_update(12);
        assert_eq!(setup.cold.num_replicas(), 1);
    }

    #[test]
    fn drain_waits_while_cold_is_full() {
        // cold can hold nothing
        let setup = setup(0, 1, 0.0);
        let file = add_archive_file(&setup, 1024);
        let hot_replica = setup.hot.create_replica(&setup.ctx, &file, 0).unwrap();
        hot_replica.increase(1024, 0);
        hot_replica.increment_usage();

        setup
            .gen
            .state
            .borrow_mut()
            .pending_deletions
            .entry(0)
            .or_default()
            .push(Rc::clone(&hot_replica));

        setup.gen.update_pending_deletions(0);
        // still on hot, re-queued for later
        assert_eq!(setup.hot.num_replicas(), 1);
        let state = setup.gen.state.borrow();
        let pending: usize = state.pending_deletions.values().map(Vec::len).sum();
        assert_eq!(pending, 1);
    }

    #[test]
    fn drain_removes_hot_copy_once_cold_has_one() {
        let setup = setup(0, 0, 0.0);
        let file = add_archive_file(&setup, 1024);
        let hot_replica = setup.hot.create_replica(&setup.ctx, &file, 0).unwrap();
        hot_replica.increase(1024, 0);
        let cold_replica = setup.cold.create_replica(&setup.ctx, &file, 0).unwrap();
        cold_replica.increase(1024, 0);

        setup
            .gen
            .state
            .borrow_mut()
            .pending_deletions
            .entry(0)
            .or_default()
            .push(Rc::clone(&hot_replica));
        drop(hot_replica);

        setup.gen.update_pending_deletions(0);
        assert_eq!(setup.hot.num_replicas(), 0);
        assert!(file.replica_at(&setup.cold).is_some());
    }
}
