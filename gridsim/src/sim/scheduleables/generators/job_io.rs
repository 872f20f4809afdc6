//! I/O-bound job pipeline: cloud storage feeds local disk, jobs read their
//! input from disk into the worker nodes, run for a sampled duration and
//! upload their outputs.
//!
//! Per site the pipeline is described by three links (cloud to disk, disk
//! to CPU, CPU to output). Downloads share the disk-to-CPU bandwidth
//! equally; uploads share the CPU-to-output bandwidth. Every read and write
//! leaves a row in the Traces table.

use std::cell::RefCell;
use std::rc::Rc;

use crate::common::random::ValueGen;
use crate::common::{Ctx, Id, Space, Tick, SECONDS_PER_MONTH};
use crate::infrastructure::{FileRef, NetworkLinkRef, ReplicaRef, Rucio};
use crate::output::{PreparedInsert, ValuesContainer};
use crate::sim::scheduleables::TransferManager;
use crate::sim::{SchedState, Schedulable};

pub(crate) const TRACES_INSERT: &str =
    "COPY Traces(id, jobId, storageElementId, fileId, replicaId, type, startedAt, finishedAt, \
     traffic) FROM STDIN with(FORMAT csv);";

/// Trace row kinds.
pub(crate) const TRACE_READ: u32 = 0;
pub(crate) const TRACE_WRITE: u32 = 1;

/// Lifetime given to job output files.
const OUTPUT_FILE_LIFETIME: Tick = 6 * SECONDS_PER_MONTH;

struct Job {
    id: Id,
    input_file: FileRef,
    cur_input_size: Space,
    started_at: Tick,
    finished_at: Tick,
    output_replicas: Vec<ReplicaRef>,
}

/// Static configuration plus job list of one site.
pub struct JobIoSite {
    pub num_cores: usize,
    pub core_fill_rate: usize,
    /// Disk fill ratio below which new inputs are pre-staged from the
    /// cloud.
    pub disk_limit_threshold: f64,
    pub job_duration_gen: ValueGen,
    pub num_output_gen: ValueGen,
    pub output_size_gen: ValueGen,
    pub cloud_to_disk_link: NetworkLinkRef,
    pub disk_to_cpu_link: NetworkLinkRef,
    pub cpu_to_output_link: NetworkLinkRef,
    jobs: RefCell<Vec<Job>>,
}

impl JobIoSite {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_cores: usize,
        core_fill_rate: usize,
        disk_limit_threshold: f64,
        job_duration_gen: ValueGen,
        num_output_gen: ValueGen,
        output_size_gen: ValueGen,
        cloud_to_disk_link: NetworkLinkRef,
        disk_to_cpu_link: NetworkLinkRef,
        cpu_to_output_link: NetworkLinkRef,
    ) -> JobIoSite {
        JobIoSite {
            num_cores,
            core_fill_rate,
            disk_limit_threshold,
            job_duration_gen,
            num_output_gen,
            output_size_gen,
            cloud_to_disk_link,
            disk_to_cpu_link,
            cpu_to_output_link,
            jobs: RefCell::new(Vec::new()),
        }
    }

    pub fn num_jobs(&self) -> usize {
        self.jobs.borrow().len()
    }
}

pub struct JobIoTransferGen {
    sched: SchedState,
    ctx: Ctx,
    rucio: Rc<Rucio>,
    mgr: Rc<TransferManager>,
    tick_freq: Tick,
    last_update: std::cell::Cell<Tick>,
    sites: Vec<JobIoSite>,
    trace_insert: Rc<PreparedInsert>,
}

impl JobIoTransferGen {
    pub fn new(
        ctx: Ctx,
        name: impl Into<String>,
        rucio: Rc<Rucio>,
        mgr: Rc<TransferManager>,
        sites: Vec<JobIoSite>,
        tick_freq: Tick,
        start_tick: Tick,
    ) -> Rc<Self> {
        let trace_insert = ctx.output.borrow().prepare_insert(TRACES_INSERT, 9, '?');
        Rc::new(JobIoTransferGen {
            sched: SchedState::new(name, start_tick),
            ctx,
            rucio,
            mgr,
            tick_freq,
            last_update: std::cell::Cell::new(start_tick),
            sites,
            trace_insert,
        })
    }

    pub fn sites(&self) -> &[JobIoSite] {
        &self.sites
    }

    fn add_trace_row(
        &self,
        rows: &mut ValuesContainer,
        job_id: Id,
        storage_element_id: Id,
        file_id: Id,
        replica_id: Id,
        kind: u32,
        started_at: Tick,
        finished_at: Tick,
        traffic: Space,
    ) {
        rows.add_value(self.ctx.ids.next());
        rows.add_value(job_id);
        rows.add_value(storage_element_id);
        rows.add_value(file_id);
        rows.add_value(replica_id);
        rows.add_value(kind);
        rows.add_value(started_at);
        rows.add_value(finished_at);
        rows.add_value(traffic);
    }

    fn update_site(&self, site: &JobIoSite, time_diff: Tick, now: Tick, rows: &mut ValuesContainer) {
        let disk_to_cpu = &site.disk_to_cpu_link;
        let cpu_to_output = &site.cpu_to_output_link;
        let disk = disk_to_cpu.src();
        let cpu_out_dst = cpu_to_output.dst();

        let download_bytes = (disk_to_cpu.bandwidth_bytes_per_second() as f64
            / (disk_to_cpu.num_active() + 1) as f64
            * time_diff as f64) as Space;

        let mut jobs = site.jobs.borrow_mut();
        let mut idx = 0;
        while idx < jobs.len() {
            let mut done = false;
            {
                let job = &mut jobs[idx];
                let input_size = job.input_file.size();
                if job.cur_input_size < input_size {
                    // downloading the input from disk into the worker
                    if job.cur_input_size == 0 {
                        job.cur_input_size = 1;
                        job.started_at = now;
                        disk_to_cpu.add_active(1);
                    }
                    let new_size = job.cur_input_size + download_bytes;
                    if new_size >= input_size {
                        disk_to_cpu.add_traffic(input_size - job.cur_input_size);
                        disk_to_cpu.add_active(-1);
                        disk_to_cpu.count_done();
                        job.cur_input_size = input_size;

                        let src_replica_id = job
                            .input_file
                            .replica_at(&disk)
                            .map(|replica| replica.id())
                            .unwrap_or(0);
                        self.add_trace_row(
                            rows,
                            job.id,
                            disk.id(),
                            job.input_file.id(),
                            src_replica_id,
                            TRACE_READ,
                            job.started_at,
                            now,
                            input_size,
                        );

                        let duration = {
                            let mut rng = self.ctx.rng.borrow_mut();
                            site.job_duration_gen.sample(&mut *rng).max(0.0) as Tick
                        };
                        job.started_at = now;
                        job.finished_at = now + duration;
                    } else {
                        disk_to_cpu.add_traffic(download_bytes);
                        job.cur_input_size = new_size;
                    }
                } else if job.output_replicas.is_empty() && now >= job.finished_at {
                    // payload done, create the output replicas
                    let num_outputs = {
                        let mut rng = self.ctx.rng.borrow_mut();
                        site.num_output_gen.sample_count(&mut *rng)
                    };
                    for _ in 0..num_outputs {
                        let size = {
                            let mut rng = self.ctx.rng.borrow_mut();
                            (site.output_size_gen.sample(&mut *rng).max(1.0)) as Space
                        };
                        let output_file = self.rucio.create_file(size, now, OUTPUT_FILE_LIFETIME);
                        match cpu_out_dst.create_replica(&self.ctx, &output_file, now) {
                            Some(replica) => {
                                cpu_to_output.add_active(1);
                                job.output_replicas.push(replica);
                            }
                            None => log::warn!(
                                "jobIO could not create output replica on {}",
                                cpu_out_dst.name()
                            ),
                        }
                    }
                    if num_outputs == 0 {
                        done = true;
                    }
                } else if !job.output_replicas.is_empty() {
                    // uploading the outputs
                    let upload_bytes = (cpu_to_output.bandwidth_bytes_per_second() as f64
                        / (cpu_to_output.num_active() + 1) as f64
                        * time_diff as f64) as Space;
                    let mut out_idx = 0;
                    while out_idx < job.output_replicas.len() {
                        let replica = Rc::clone(&job.output_replicas[out_idx]);
                        let amount = replica.increase(upload_bytes, now);
                        cpu_to_output.add_traffic(amount);
                        if replica.is_complete() {
                            cpu_to_output.add_active(-1);
                            cpu_to_output.count_done();
                            self.add_trace_row(
                                rows,
                                job.id,
                                replica.storage_element_id(),
                                replica.file().id(),
                                replica.id(),
                                TRACE_WRITE,
                                job.finished_at,
                                now,
                                replica.file().size(),
                            );
                            job.output_replicas.swap_remove(out_idx);
                        } else {
                            out_idx += 1;
                        }
                    }
                    if job.output_replicas.is_empty() {
                        done = true;
                    }
                }
            }

            if done {
                // release the disk input when every planned use happened
                let job = jobs.swap_remove(idx);
                if let Some(input_replica) = job.input_file.replica_at(&disk) {
                    if input_replica.num_staged_in() >= job.input_file.popularity() {
                        disk.remove_replica(&input_replica, now, true);
                    }
                }
            } else {
                idx += 1;
            }
        }

        // fill free cores from complete disk replicas that still owe runs
        debug_assert!(site.num_cores >= jobs.len());
        let mut num_to_create = (site.num_cores - jobs.len()).min(site.core_fill_rate);
        for replica in disk.replicas() {
            if num_to_create == 0 {
                break;
            }
            if !replica.is_complete() {
                continue;
            }
            if replica.num_staged_in() >= replica.file().popularity() {
                continue;
            }
            replica.mark_staged_in();
            jobs.push(Job {
                id: self.ctx.ids.next(),
                input_file: Rc::clone(replica.file()),
                cur_input_size: 0,
                started_at: now,
                finished_at: now,
                output_replicas: Vec::new(),
            });
            num_to_create -= 1;
        }
        drop(jobs);

        // opportunistic pre-staging while the disk has headroom
        if disk.used_ratio() <= site.disk_limit_threshold {
            let cloud_to_disk = &site.cloud_to_disk_link;
            let free_slots = cloud_to_disk
                .max_num_active_transfers()
                .saturating_sub(cloud_to_disk.num_active());
            let mut num_transfers = (free_slots / 2) as usize;
            for replica in cloud_to_disk.src().replicas() {
                if num_transfers == 0 {
                    break;
                }
                if !replica.is_complete() {
                    continue;
                }
                let file = replica.file();
                let on_any_disk = self
                    .sites
                    .iter()
                    .any(|other| file.replica_at(&other.disk_to_cpu_link.src()).is_some());
                if on_any_disk {
                    continue;
                }
                match disk.create_replica(&self.ctx, file, now) {
                    Some(new_replica) => {
                        self.mgr.create_transfer(&replica, &new_replica, now, true);
                        num_transfers -= 1;
                    }
                    None => break,
                }
            }
        }
    }
}

impl Schedulable for JobIoTransferGen {
    fn sched(&self) -> &SchedState {
        &self.sched
    }

    fn on_update(&self, now: Tick) {
        debug_assert!(now >= self.last_update.get());
        let time_diff = now - self.last_update.get();
        self.last_update.set(now);

        let mut rows = self.trace_insert.values_container(9 * 16);
        for site in &self.sites {
            self.update_site(site, time_diff, now, &mut rows);
        }
        self.ctx.output.borrow().queue_inserts(rows);

        self.sched.reschedule_at(now + self.tick_freq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::testutil::test_ctx;
    use crate::infrastructure::StorageElementRef;
    use crate::sim::scheduleables::transfer_manager::BaseTransferManager;

    struct Setup {
        ctx: Ctx,
        rucio: Rc<Rucio>,
        cloud: StorageElementRef,
        disk: StorageElementRef,
        output: StorageElementRef,
        gen: Rc<JobIoTransferGen>,
        mgr: Rc<TransferManager>,
    }

    fn setup() -> Setup {
        let ctx = test_ctx();
        let rucio = Rucio::new(Rc::clone(&ctx));
        let site = rucio.create_grid_site("site".into(), "eu".into(), 0);
        let mk = |name: &str| {
            site.create_storage_element(
                &ctx,
                name.into(),
                false,
                0,
                ValueGen::fixed(0.0),
                None,
            )
        };
        let cloud = mk("cloud");
        let disk = mk("disk");
        let cpu = mk("cpu");
        let output = mk("output");
        let cloud_to_disk = cloud.create_network_link(&ctx, &disk, 1 << 30);
        cloud_to_disk.set_max_num_active_transfers(10);
        let disk_to_cpu = disk.create_network_link(&ctx, &cpu, 1 << 20);
        let cpu_to_output = cpu.create_network_link(&ctx, &output, 1 << 20);

        let mgr = TransferManager::new(Rc::clone(&ctx), "mgr", 1, 0);
        let site_info = JobIoSite::new(
            4,
            2,
            0.5,
            ValueGen::fixed(10.0),
            ValueGen::fixed(1.0),
            ValueGen::fixed(512.0 * 1024.0),
            cloud_to_disk,
            disk_to_cpu,
            cpu_to_output,
        );
        let gen = JobIoTransferGen::new(
            Rc::clone(&ctx),
            "JobIO",
            Rc::clone(&rucio),
            Rc::clone(&mgr),
            vec![site_info],
            1,
            0,
        );
        Setup {
            ctx,
            rucio,
            cloud,
            disk,
            output,
            gen,
            mgr,
        }
    }

    fn stage_disk_file(setup: &Setup, size: Space, popularity: u32) -> FileRef {
        let file = setup.rucio.create_file(size, 0, 1_000_000);
        file.set_popularity(popularity);
        let replica = setup.disk.create_replica(&setup.ctx, &file, 0).unwrap();
        replica.increase(size, 0);
        file
    }

    #[test]
    fn job_runs_through_download_run_upload() {
        let setup = setup();
        let file = stage_disk_file(&setup, 1 << 20, 1);

        // tick 0: job admitted; tick 1: download finishes (1 MiB at 1 MiB/s)
        setup.gen.on_update(0);
        assert_eq!(setup.gen.sites()[0].num_jobs(), 1);
        setup.gen.on_update(1);

        // runs for 10 ticks, then one 512 KiB output replica is created
        for now in 2..=11 {
            setup.gen.on_update(now);
        }
        assert_eq!(setup.output.num_replicas(), 1);

        // upload at 1 MiB/s shared: finishes within a tick
        setup.gen.on_update(12);
        setup.gen.on_update(13);
        assert_eq!(setup.gen.sites()[0].num_jobs(), 0);
        // popularity 1, staged once: input replica released from disk
        assert!(file.replica_at(&setup.disk).is_none());
    }

    #[test]
    fn popular_inputs_are_staged_until_popularity_is_consumed() {
        let setup = setup();
        let file = stage_disk_file(&setup, 1 << 20, 3);

        // one admission per replica and tick, up to the file's popularity
        setup.gen.on_update(0);
        assert_eq!(setup.gen.sites()[0].num_jobs(), 1);
        let replica = file.replica_at(&setup.disk).unwrap();
        assert_eq!(replica.num_staged_in(), 1);

        setup.gen.on_update(1);
        assert_eq!(setup.gen.sites()[0].num_jobs(), 2);
        setup.gen.on_update(2);
        assert_eq!(setup.gen.sites()[0].num_jobs(), 3);
        assert_eq!(replica.num_staged_in(), 3);
    }

    #[test]
    fn empty_disk_pre_stages_from_cloud() {
        let setup = setup();
        let file = setup.rucio.create_file(1 << 20, 0, 1_000_000);
        let cloud_replica = setup.cloud.create_replica(&setup.ctx, &file, 0).unwrap();
        cloud_replica.increase(1 << 20, 0);

        setup.gen.on_update(0);
        assert_eq!(setup.disk.num_replicas(), 1);
        assert_eq!(setup.mgr.num_queued() + setup.mgr.num_active(), 1);
    }
}
