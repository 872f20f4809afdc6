//! Schedulables that are not transfer related: data generation, reaping,
//! billing and the heartbeat.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Instant;

use itertools::Itertools;

use crate::clouds::Cloud;
use crate::common::random::ValueGen;
use crate::common::{days_to_seconds, gib_to_bytes, seconds_to_months, Ctx, Tick};
use crate::infrastructure::{Rucio, StorageElementRef};
use crate::output::PreparedInsert;
use crate::sim::scheduleables::BaseTransferManager;
use crate::sim::{SchedState, Schedulable};

/// Creates new files (and their initial replicas) from sampled sizes and
/// lifetimes. File sizes are sampled in GiB, lifetimes in days.
pub struct DataGenerator {
    sched: SchedState,
    ctx: Ctx,
    rucio: Rc<Rucio>,
    num_files_gen: ValueGen,
    file_size_gen: ValueGen,
    file_lifetime_gen: ValueGen,
    tick_freq: Tick,
    /// Entry `i` is the share of files that start with `i + 1` replicas.
    pub num_replica_ratios: Vec<f32>,
    pub select_storage_elements_randomly: bool,
    storage_elements: Vec<StorageElementRef>,
}

impl DataGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Ctx,
        rucio: Rc<Rucio>,
        name: impl Into<String>,
        num_files_gen: ValueGen,
        file_size_gen: ValueGen,
        file_lifetime_gen: ValueGen,
        storage_elements: Vec<StorageElementRef>,
        tick_freq: Tick,
        start_tick: Tick,
    ) -> Rc<Self> {
        assert!(!storage_elements.is_empty(), "data generator needs targets");
        Rc::new(DataGenerator {
            sched: SchedState::new(name, start_tick),
            ctx,
            rucio,
            num_files_gen,
            file_size_gen,
            file_lifetime_gen,
            tick_freq,
            num_replica_ratios: Vec::new(),
            select_storage_elements_randomly: false,
            storage_elements,
        })
    }

    /// Creates `num_files` files with `num_replicas_per_file` replicas
    /// each. Replicas arrive fully: the initial copy is increased to the
    /// file size immediately and expires after `lifetime / num_replicas`.
    pub fn create_files_and_replicas(
        &self,
        num_files: u32,
        num_replicas_per_file: u32,
        now: Tick,
    ) {
        if num_files == 0 || num_replicas_per_file == 0 {
            return;
        }
        let num_elements = self.storage_elements.len() as u32;
        assert!(
            num_replicas_per_file <= num_elements,
            "more replicas per file than storage elements"
        );

        self.rucio.reserve_file_space(num_files as usize);
        let mut elements = self.storage_elements.clone();
        for _ in 0..num_files {
            let (size_gib, lifetime_days) = {
                let mut rng = self.ctx.rng.borrow_mut();
                (
                    self.file_size_gen.sample(&mut *rng).max(0.0),
                    self.file_lifetime_gen.sample(&mut *rng).max(0.0),
                )
            };
            let size = gib_to_bytes(size_gib).max(1);
            let lifetime = days_to_seconds(lifetime_days);
            let file = self.rucio.create_file(size, now, lifetime);

            if self.select_storage_elements_randomly {
                // partial shuffle so each file draws without replacement
                let mut rng = self.ctx.rng.borrow_mut();
                for chosen in 0..num_replicas_per_file as usize {
                    let remaining = elements.len() - chosen;
                    let pick = chosen + rand::Rng::gen_range(&mut *rng, 0..remaining);
                    elements.swap(chosen, pick);
                }
            }

            for element in elements.iter().take(num_replicas_per_file as usize) {
                match element.create_replica(&self.ctx, &file, now) {
                    Some(replica) => {
                        replica.increase(size, now);
                        replica.set_expires_at(now + lifetime / num_replicas_per_file as u64);
                    }
                    None => log::warn!(
                        "data generator could not place replica of file {} on {}",
                        file.id(),
                        element.name()
                    ),
                }
            }
        }
    }

    fn generate(&self, now: Tick) {
        let total = {
            let mut rng = self.ctx.rng.borrow_mut();
            self.num_files_gen.sample_count(&mut *rng) as u32
        };
        if self.num_replica_ratios.is_empty() {
            self.create_files_and_replicas(total, 1, now);
            return;
        }
        for (idx, ratio) in self.num_replica_ratios.iter().enumerate() {
            let num_files = (total as f32 * ratio) as u32;
            self.create_files_and_replicas(num_files, idx as u32 + 1, now);
        }
    }
}

impl Schedulable for DataGenerator {
    fn sched(&self) -> &SchedState {
        &self.sched
    }

    fn on_update(&self, now: Tick) {
        self.generate(now);
        if self.tick_freq > 0 {
            self.sched.reschedule_at(now + self.tick_freq);
        }
    }
}

/// Periodically runs the catalogue reaper.
pub struct ReaperCaller {
    sched: SchedState,
    rucio: Rc<Rucio>,
    tick_freq: Tick,
}

impl ReaperCaller {
    pub fn new(rucio: Rc<Rucio>, tick_freq: Tick, start_tick: Tick) -> Rc<Self> {
        Rc::new(ReaperCaller {
            sched: SchedState::new("Reaper", start_tick),
            rucio,
            tick_freq,
        })
    }
}

impl Schedulable for ReaperCaller {
    fn sched(&self) -> &SchedState {
        &self.sched
    }

    fn on_update(&self, now: Tick) {
        self.rucio.run_reaper(now);
        self.sched.reschedule_at(now + self.tick_freq);
    }
}

/// Rolls up each cloud's bill once per period (monthly by default) and
/// pushes one Bills row per cloud.
pub struct BillingGenerator {
    sched: SchedState,
    ctx: Ctx,
    clouds: Vec<Rc<dyn Cloud>>,
    tick_freq: Tick,
    insert: Rc<PreparedInsert>,
}

impl BillingGenerator {
    pub fn new(
        ctx: Ctx,
        clouds: Vec<Rc<dyn Cloud>>,
        tick_freq: Tick,
        start_tick: Tick,
    ) -> Rc<Self> {
        let insert = ctx.output.borrow().prepare_insert(
            "COPY Bills(cloudName, month, bill) FROM STDIN with(FORMAT csv);",
            3,
            '?',
        );
        Rc::new(BillingGenerator {
            sched: SchedState::new("Billing", start_tick),
            ctx,
            clouds,
            tick_freq,
            insert,
        })
    }
}

impl Schedulable for BillingGenerator {
    fn sched(&self) -> &SchedState {
        &self.sched
    }

    fn on_update(&self, now: Tick) {
        let month = seconds_to_months(now);
        let mut rows = self.insert.values_container(3 * self.clouds.len());
        let mut summary = String::from("========== Monthly Summary ==========\n");
        for cloud in &self.clouds {
            let bill = cloud.process_billing(now);
            let text = bill.to_string();
            summary.push_str(&format!(
                "{} - billing for month {}:\n{}",
                cloud.name(),
                month,
                text
            ));
            rows.add_value(cloud.name());
            rows.add_value(month);
            rows.add_value(text);
        }
        summary.push_str("=====================================");
        log::info!("{}", summary);

        self.ctx.output.borrow().queue_inserts(rows);
        self.sched.reschedule_at(now + self.tick_freq);
    }
}

/// Periodic progress summary: how much wall-clock each observed schedulable
/// consumed since the last beat and what the transfer managers did.
/// Durations and manager counters are reset after reporting.
pub struct Heartbeat {
    sched: SchedState,
    rucio: Rc<Rucio>,
    managers: Vec<Rc<dyn BaseTransferManager>>,
    observed: RefCell<Vec<Weak<dyn Schedulable>>>,
    tick_freq: Tick,
    wall_of_last_beat: Cell<Instant>,
}

impl Heartbeat {
    pub fn new(
        rucio: Rc<Rucio>,
        managers: Vec<Rc<dyn BaseTransferManager>>,
        tick_freq: Tick,
        start_tick: Tick,
    ) -> Rc<Self> {
        Rc::new(Heartbeat {
            sched: SchedState::new("Heartbeat", start_tick),
            rucio,
            managers,
            observed: RefCell::new(Vec::new()),
            tick_freq,
            wall_of_last_beat: Cell::new(Instant::now()),
        })
    }

    /// Registers a schedulable whose update durations appear in the beat.
    pub fn observe(&self, schedulable: Weak<dyn Schedulable>) {
        self.observed.borrow_mut().push(schedulable);
    }
}

impl Schedulable for Heartbeat {
    fn sched(&self) -> &SchedState {
        &self.sched
    }

    fn on_update(&self, now: Tick) {
        let wall_now = Instant::now();
        let wall_diff = wall_now.duration_since(self.wall_of_last_beat.get());
        self.wall_of_last_beat.set(wall_now);

        let mut report = format!(
            "[{:>6}k] files: {:.1}k\n",
            now / 1000,
            self.rucio.num_files() as f64 / 1000.0
        );

        report.push_str("transfer stats:\n");
        for manager in &self.managers {
            let stats = manager.stats();
            let total = manager.num_active() as u64
                + stats.num_completed() as u64
                + stats.num_failed() as u64;
            let mean = if total > 0 {
                format!("{}", stats.summed_duration() / total)
            } else {
                "-".to_owned()
            };
            report.push_str(&format!(
                "  {}: active={} done={} failed={} avg_duration={}\n",
                manager.name(),
                manager.num_active(),
                stats.num_completed(),
                stats.num_failed(),
                mean
            ));
            stats.reset();
        }

        let lines = {
            let mut observed = self.observed.borrow_mut();
            observed.retain(|weak| weak.strong_count() > 0);
            observed
                .iter()
                .filter_map(Weak::upgrade)
                .map(|schedulable| {
                    let spent = schedulable.sched().take_update_duration();
                    let share = if wall_diff.as_secs_f64() > 0.0 {
                        spent.as_secs_f64() / wall_diff.as_secs_f64() * 100.0
                    } else {
                        0.0
                    };
                    format!(
                        "  {}: {:.3}s ({:.1}%)",
                        schedulable.sched().name(),
                        spent.as_secs_f64(),
                        share
                    )
                })
                .join("\n")
        };
        report.push_str(&format!(
            "sim stats (wall {:.2}s):\n{}",
            wall_diff.as_secs_f64(),
            lines
        ));

        log::info!("{}", report);
        self.sched.reschedule_at(now + self.tick_freq);
    }
}
