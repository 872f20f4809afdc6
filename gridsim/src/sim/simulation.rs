//! Profile-driven composition and the event loop.
//!
//! [Simulation::from_profile] builds the whole model: the grid from the
//! `rucio` section, clouds through the factory registry, network links from
//! the link matrix, then the transfer managers, generators, data
//! generators, reaper, billing and heartbeat as configured. Topology rows
//! are written to the sink while it still accepts direct inserts.
//!
//! [Simulation::run] drives the loop until the schedule drains or
//! `max_tick` passes, then shuts every remaining schedulable down and
//! removes all files, which flushes their rows through the deletion
//! listeners.

use std::rc::Rc;
use std::time::Instant;

use indexmap::IndexMap;

use crate::clouds::{Cloud, CloudFactoryRegistry};
use crate::common::random::ValueGen;
use crate::common::{Ctx, Tick, SECONDS_PER_DAY, SECONDS_PER_MONTH};
use crate::config::{
    ConfigError, DataGenCfg, LinkCfg, Profile, ProfileLoader, TransferGenCfg, TransferManagerCfg,
    TransferManagerKind,
};
use crate::infrastructure::{
    NetworkLinkRef, Rucio, SiteRef, StorageElementListener, StorageElementRef,
};
use crate::sim::scheduleables::generators::{
    BufferedOnDeletionInsert, CachedSrcTransferGen, CacheElement, CloudBufferInfo,
    CloudBufferTransferGen, FixedTarget, FixedTransferGen, HcdcTransferGen, JobIoSite,
    JobIoTransferGen, JobSlotInfo, JobSlotTransferGen,
};
use crate::sim::scheduleables::{
    BaseTransferManager, BillingGenerator, DataGenerator, FixedTimeTransferManager, Heartbeat,
    ReaperCaller, TransferManager,
};
use crate::sim::{Schedulable, Schedule};

enum AnyManager {
    Bandwidth(Rc<TransferManager>),
    FixedTime(Rc<FixedTimeTransferManager>),
}

impl AnyManager {
    fn as_schedulable(&self) -> Rc<dyn Schedulable> {
        match self {
            AnyManager::Bandwidth(mgr) => Rc::clone(mgr) as _,
            AnyManager::FixedTime(mgr) => Rc::clone(mgr) as _,
        }
    }

    fn as_base(&self) -> Rc<dyn BaseTransferManager> {
        match self {
            AnyManager::Bandwidth(mgr) => Rc::clone(mgr) as _,
            AnyManager::FixedTime(mgr) => Rc::clone(mgr) as _,
        }
    }
}

pub struct Simulation {
    ctx: Ctx,
    rucio: Rc<Rucio>,
    clouds: Vec<Rc<dyn Cloud>>,
    elements: IndexMap<String, StorageElementRef>,
    schedule: Schedule,
    max_tick: Tick,
    current_tick: Tick,
    deletion_insert: Rc<BufferedOnDeletionInsert>,
}

impl Simulation {
    pub fn from_profile(
        ctx: Ctx,
        profile: &Profile,
        loader: &ProfileLoader,
        factories: &CloudFactoryRegistry,
    ) -> Result<Simulation, ConfigError> {
        let rucio = Rucio::new(Rc::clone(&ctx));

        // grid sites and their storage elements
        for site_cfg in &profile.rucio.sites {
            let site = rucio.create_grid_site(
                site_cfg.name.clone(),
                site_cfg.location.clone(),
                site_cfg.multi_location_idx,
            );
            for element_cfg in &site_cfg.storage_elements {
                let access_latency = match &element_cfg.access_latency {
                    Some(cfg) => ValueGen::from_cfg(cfg)?,
                    None => ValueGen::fixed(0.0),
                };
                site.create_storage_element(
                    &ctx,
                    element_cfg.name.clone(),
                    element_cfg.allow_duplicate_replicas,
                    element_cfg.limit,
                    access_latency,
                    None,
                );
            }
            let custom = site_cfg
                .custom
                .iter()
                .map(|(key, value)| {
                    let text = match value.as_str() {
                        Some(s) => s.to_owned(),
                        None => value.to_string(),
                    };
                    (key.clone(), text)
                })
                .collect();
            site.set_custom_config(custom);
        }

        // clouds
        let mut clouds: Vec<Rc<dyn Cloud>> = Vec::new();
        for entry in &profile.clouds {
            let cloud = factories
                .create(&entry.id, entry.name.clone())
                .ok_or_else(|| ConfigError::UnknownKind(format!("cloud id {}", entry.id)))?;
            cloud.load_config(&ctx, loader, &entry.cfg)?;
            clouds.push(cloud);
        }

        // unique name registry over every storage element
        let mut elements: IndexMap<String, StorageElementRef> = IndexMap::new();
        let mut register =
            |element: StorageElementRef| -> Result<(), ConfigError> {
                let name = element.name().to_owned();
                if elements.insert(name.clone(), element).is_some() {
                    return Err(ConfigError::DuplicateName(name));
                }
                Ok(())
            };
        for site in rucio.grid_sites() {
            for element in site.storage_elements() {
                register(element)?;
            }
        }
        for cloud in &clouds {
            for region in cloud.regions() {
                for element in region.storage_elements() {
                    register(element)?;
                }
            }
        }

        let mut sim = Simulation {
            deletion_insert: BufferedOnDeletionInsert::new(Rc::clone(&ctx)),
            ctx,
            rucio,
            clouds,
            elements,
            schedule: Schedule::new(),
            max_tick: profile.max_tick,
            current_tick: 0,
        };

        sim.create_output_tables()?;
        sim.add_topology_to_output()?;
        sim.setup_links(profile)?;
        sim.register_deletion_listeners();
        sim.setup_scheduleables(profile)?;

        Ok(sim)
    }

    pub fn rucio(&self) -> &Rc<Rucio> {
        &self.rucio
    }

    pub fn clouds(&self) -> &[Rc<dyn Cloud>] {
        &self.clouds
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    pub fn storage_element_by_name(&self, name: &str) -> Option<StorageElementRef> {
        self.elements.get(name).map(Rc::clone)
    }

    fn element(&self, name: &str) -> Result<StorageElementRef, ConfigError> {
        self.storage_element_by_name(name)
            .ok_or_else(|| ConfigError::UnknownStorageElement(name.to_owned()))
    }

    fn link(&self, src: &str, dst: &str) -> Result<NetworkLinkRef, ConfigError> {
        let src_element = self.element(src)?;
        let dst_element = self.element(dst)?;
        src_element
            .network_link_to(&dst_element)
            .ok_or_else(|| ConfigError::UnknownNetworkLink(src.to_owned(), dst.to_owned()))
    }

    fn create_output_tables(&self) -> Result<(), ConfigError> {
        let mut output = self.ctx.output.borrow_mut();
        if !output.init_queries.is_empty() {
            output
                .initialise()
                .map_err(|err| ConfigError::InvalidValue(err.to_string()))?;
            return Ok(());
        }
        let tables: [(&str, &str); 8] = [
            ("Sites", "id BIGINT, name varchar, locationName varchar, kind varchar"),
            ("StorageElements", "id BIGINT, siteId BIGINT, name varchar"),
            ("NetworkLinks", "id BIGINT, srcStorageElementId BIGINT, dstStorageElementId BIGINT"),
            ("Files", "id BIGINT, createdAt BIGINT, expiredAt BIGINT, filesize BIGINT, popularity INT"),
            ("Replicas", "id BIGINT, fileId BIGINT, storageElementId BIGINT, createdAt BIGINT, expiredAt BIGINT"),
            ("Transfers", "id BIGINT, srcStorageElementId BIGINT, dstStorageElementId BIGINT, fileId BIGINT, srcReplicaId BIGINT, dstReplicaId BIGINT, queuedAt BIGINT, startedAt BIGINT, finishedAt BIGINT, traffic BIGINT"),
            ("Traces", "id BIGINT, jobId BIGINT, storageElementId BIGINT, fileId BIGINT, replicaId BIGINT, type INT, startedAt BIGINT, finishedAt BIGINT, traffic BIGINT"),
            ("Bills", "cloudName varchar, month INT, bill varchar"),
        ];
        for (name, columns) in tables {
            output
                .create_table(name, columns)
                .map_err(|err| ConfigError::InvalidValue(err.to_string()))?;
        }
        Ok(())
    }

    fn add_site_to_output(&self, site: &SiteRef) -> Result<(), ConfigError> {
        let mut output = self.ctx.output.borrow_mut();
        let row = format!(
            "{},'{}','{}','{}'",
            site.id(),
            site.name(),
            site.location_name(),
            site.kind().label()
        );
        output
            .insert_row("Sites", &row)
            .map_err(|err| ConfigError::InvalidValue(err.to_string()))?;
        for element in site.storage_elements() {
            let row = format!("{},{},'{}'", element.id(), site.id(), element.name());
            output
                .insert_row("StorageElements", &row)
                .map_err(|err| ConfigError::InvalidValue(err.to_string()))?;
        }
        Ok(())
    }

    fn add_topology_to_output(&self) -> Result<(), ConfigError> {
        for site in self.rucio.grid_sites() {
            self.add_site_to_output(&site)?;
        }
        for cloud in &self.clouds {
            for region in cloud.regions() {
                self.add_site_to_output(&region)?;
            }
        }
        Ok(())
    }

    fn setup_link(
        &self,
        cfg: &LinkCfg,
        src_name: &str,
        dst_name: &str,
    ) -> Result<(), ConfigError> {
        let src = self.element(src_name)?;
        let dst = self.element(dst_name)?;
        let (datarate, is_throughput) = cfg.datarate(src_name, dst_name)?;
        let link = src.create_network_link(&self.ctx, &dst, datarate);
        link.set_is_throughput(is_throughput);
        link.set_max_num_active_transfers(cfg.max_active_transfers);

        let row = format!("{},{},{}", link.id(), src.id(), dst.id());
        self.ctx
            .output
            .borrow_mut()
            .insert_row("NetworkLinks", &row)
            .map_err(|err| ConfigError::InvalidValue(err.to_string()))
    }

    fn setup_links(&self, profile: &Profile) -> Result<(), ConfigError> {
        for (src_name, destinations) in &profile.links {
            for (dst_name, link_cfg) in destinations {
                self.setup_link(link_cfg, src_name, dst_name)?;
                if let Some(receiving) = &link_cfg.receiving_link {
                    self.setup_link(receiving, dst_name, src_name)?;
                }
            }
        }
        for cloud in &self.clouds {
            cloud.init_network_links()?;
        }
        Ok(())
    }

    /// Files and replicas removed anywhere end up as rows in the sink.
    fn register_deletion_listeners(&self) {
        let as_file_listener: Rc<dyn crate::infrastructure::FileListener> =
            Rc::clone(&self.deletion_insert) as _;
        self.rucio.add_file_listener(Rc::downgrade(&as_file_listener));
        let as_element_listener: Rc<dyn StorageElementListener> =
            Rc::clone(&self.deletion_insert) as _;
        for element in self.elements.values() {
            element.add_listener(Rc::downgrade(&as_element_listener));
        }
    }

    fn build_manager(&self, cfg: &TransferManagerCfg) -> AnyManager {
        match cfg.kind {
            TransferManagerKind::Bandwidth => AnyManager::Bandwidth(TransferManager::new(
                Rc::clone(&self.ctx),
                cfg.name.clone(),
                cfg.tick_freq,
                cfg.start_tick,
            )),
            TransferManagerKind::FixedTime => AnyManager::FixedTime(FixedTimeTransferManager::new(
                Rc::clone(&self.ctx),
                cfg.name.clone(),
                cfg.tick_freq,
                cfg.start_tick,
            )),
        }
    }

    fn build_generator(
        &self,
        cfg: &TransferGenCfg,
        manager: &AnyManager,
    ) -> Result<Rc<dyn Schedulable>, ConfigError> {
        let wrong_manager = || {
            ConfigError::InvalidValue(format!(
                "wrong manager type for generator {}",
                cfg.name()
            ))
        };
        match cfg {
            TransferGenCfg::Fixed {
                name,
                tick_freq,
                start_tick,
                infos,
            } => {
                let mgr = match manager {
                    AnyManager::Bandwidth(mgr) => Rc::clone(mgr),
                    _ => return Err(wrong_manager()),
                };
                let mut config = Vec::new();
                for info in infos {
                    let src = self.element(&info.storage_element)?;
                    let mut targets = Vec::new();
                    for (dst_name, gen_cfg) in &info.destinations {
                        targets.push(FixedTarget::new(
                            self.element(dst_name)?,
                            ValueGen::from_cfg(gen_cfg)?,
                        ));
                    }
                    config.push((src, targets));
                }
                let gen = FixedTransferGen::new(
                    Rc::clone(&self.ctx),
                    name.clone(),
                    mgr,
                    config,
                    *tick_freq,
                    *start_tick,
                );
                gen.register_listeners();
                Ok(gen)
            }
            TransferGenCfg::CloudBuffer {
                name,
                tick_freq,
                start_tick,
                delete_src_replica,
                read_new_src_replicas: _,
                infos,
            } => {
                let mgr = match manager {
                    AnyManager::Bandwidth(mgr) => Rc::clone(mgr),
                    _ => return Err(wrong_manager()),
                };
                let mut lanes = Vec::new();
                for info in infos {
                    let primary_link =
                        self.link(&info.src_storage_element, &info.primary_dst_storage_element)?;
                    let secondary_link = match &info.secondary_dst_storage_element {
                        Some(secondary) => {
                            Some(self.link(&info.src_storage_element, secondary)?)
                        }
                        None => None,
                    };
                    lanes.push(CloudBufferInfo::new(
                        ValueGen::from_cfg(&info.reusage_num_cfg)?,
                        primary_link,
                        secondary_link,
                    ));
                }
                let gen = CloudBufferTransferGen::new(
                    Rc::clone(&self.ctx),
                    name.clone(),
                    mgr,
                    lanes,
                    *delete_src_replica,
                    *tick_freq,
                    *start_tick,
                );
                gen.register_listeners();
                Ok(gen)
            }
            TransferGenCfg::CachedSrc {
                name,
                tick_freq,
                start_tick,
                num_per_day,
                default_replica_lifetime,
                src_storage_elements,
                cache_storage_elements,
                dst_storage_elements,
                access_count_ratios,
            } => {
                let mgr = match manager {
                    AnyManager::FixedTime(mgr) => Rc::clone(mgr),
                    _ => return Err(wrong_manager()),
                };
                let src_elements = src_storage_elements
                    .iter()
                    .map(|name| self.element(name))
                    .collect::<Result<Vec<_>, _>>()?;
                let cache_elements = cache_storage_elements
                    .iter()
                    .map(|cache| {
                        Ok(CacheElement {
                            element: self.element(&cache.storage_element)?,
                            max_replicas: cache.size as usize,
                            default_replica_lifetime: cache.default_replica_lifetime,
                        })
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                let dst_elements = dst_storage_elements
                    .iter()
                    .map(|name| self.element(name))
                    .collect::<Result<Vec<_>, _>>()?;
                let gen = CachedSrcTransferGen::new(
                    Rc::clone(&self.ctx),
                    name.clone(),
                    Rc::clone(&self.rucio),
                    mgr,
                    *num_per_day,
                    *default_replica_lifetime,
                    src_elements,
                    cache_elements,
                    dst_elements,
                    access_count_ratios.clone(),
                    *tick_freq,
                    *start_tick,
                );
                gen.register_listeners();
                Ok(gen)
            }
            TransferGenCfg::JobIo {
                name,
                tick_freq,
                start_tick,
                infos,
            } => {
                let mgr = match manager {
                    AnyManager::Bandwidth(mgr) => Rc::clone(mgr),
                    _ => return Err(wrong_manager()),
                };
                let mut sites = Vec::new();
                for info in infos {
                    sites.push(JobIoSite::new(
                        info.num_cores,
                        info.core_fill_rate,
                        info.disk_limit_threshold,
                        ValueGen::from_cfg(&info.job_duration_cfg)?,
                        ValueGen::from_cfg(&info.num_output_cfg)?,
                        ValueGen::from_cfg(&info.output_size_cfg)?,
                        self.link(&info.cloud_storage_element, &info.disk_storage_element)?,
                        self.link(&info.disk_storage_element, &info.cpu_storage_element)?,
                        self.link(&info.cpu_storage_element, &info.output_storage_element)?,
                    ));
                }
                Ok(JobIoTransferGen::new(
                    Rc::clone(&self.ctx),
                    name.clone(),
                    Rc::clone(&self.rucio),
                    mgr,
                    sites,
                    *tick_freq,
                    *start_tick,
                ))
            }
            TransferGenCfg::Hcdc {
                name,
                tick_freq,
                start_tick,
                config,
            } => {
                let mgr = match manager {
                    AnyManager::Bandwidth(mgr) => Rc::clone(mgr),
                    _ => return Err(wrong_manager()),
                };
                let archive = self.element(&config.archive_storage_element)?;
                let cold = self.element(&config.cold_storage_element)?;
                let hot = self.element(&config.hot_storage_element)?;
                let gen = HcdcTransferGen::new(
                    Rc::clone(&self.ctx),
                    name.clone(),
                    Rc::clone(&self.rucio),
                    mgr,
                    archive,
                    cold,
                    hot,
                    self.link(
                        &config.archive_storage_element,
                        &config.hot_storage_element,
                    )?,
                    self.link(
                        &config.archive_storage_element,
                        &config.cold_storage_element,
                    )?,
                    self.link(&config.hot_storage_element, &config.cpu_storage_element)?,
                    self.link(
                        &config.cpu_storage_element,
                        &config.output_storage_element,
                    )?,
                    config.production_start_time,
                    config.num_cores,
                    ValueGen::from_cfg(&config.reusage_num_cfg)?,
                    ValueGen::from_cfg(&config.num_job_submission_cfg)?,
                    ValueGen::from_cfg(&config.job_duration_cfg)?,
                    ValueGen::from_cfg(&config.num_output_cfg)?,
                    ValueGen::from_cfg(&config.output_size_cfg)?,
                    *tick_freq,
                    *start_tick,
                );
                gen.register_listeners();
                Ok(gen)
            }
            TransferGenCfg::JobSlot {
                name,
                tick_freq,
                start_tick,
                src_storage_element_prios,
                dst_infos,
            } => {
                let mgr = match manager {
                    AnyManager::FixedTime(mgr) => Rc::clone(mgr),
                    _ => return Err(wrong_manager()),
                };
                let mut priorities = std::collections::HashMap::new();
                for (element_name, prio) in src_storage_element_prios {
                    priorities.insert(self.element(element_name)?.id(), *prio);
                }
                let infos = dst_infos
                    .iter()
                    .map(|info| {
                        Ok(JobSlotInfo::new(
                            self.element(&info.storage_element)?,
                            info.num_max_slots,
                        ))
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                Ok(JobSlotTransferGen::new(
                    Rc::clone(&self.ctx),
                    name.clone(),
                    Rc::clone(&self.rucio),
                    mgr,
                    priorities,
                    infos,
                    *tick_freq,
                    *start_tick,
                ))
            }
        }
    }

    fn build_data_generator(&self, cfg: &DataGenCfg) -> Result<Rc<DataGenerator>, ConfigError> {
        let elements = cfg
            .storage_elements
            .iter()
            .map(|name| self.element(name))
            .collect::<Result<Vec<_>, _>>()?;
        let name = cfg.name.clone().unwrap_or_else(|| "DataGen".to_owned());
        let mut gen = DataGenerator::new(
            Rc::clone(&self.ctx),
            Rc::clone(&self.rucio),
            name,
            ValueGen::from_cfg(&cfg.num_files_cfg)?,
            ValueGen::from_cfg(&cfg.file_size_cfg)?,
            ValueGen::from_cfg(&cfg.lifetime_cfg)?,
            elements,
            cfg.tick_freq,
            cfg.start_tick,
        );
        {
            let gen_mut = Rc::get_mut(&mut gen).expect("generator not yet shared");
            gen_mut.num_replica_ratios = cfg.num_replica_ratios.clone();
            gen_mut.select_storage_elements_randomly = cfg.select_storage_elements_randomly;
        }
        if let Some(num_pre_sim) = cfg.num_pre_sim_start_files {
            gen.create_files_and_replicas(num_pre_sim, 1, 0);
        }
        Ok(gen)
    }

    fn setup_scheduleables(&mut self, profile: &Profile) -> Result<(), ConfigError> {
        let mut managers: Vec<Rc<dyn BaseTransferManager>> = Vec::new();
        let mut observed: Vec<Rc<dyn Schedulable>> = Vec::new();

        for transfer_cfg in &profile.transfer_cfgs {
            let manager = self.build_manager(&transfer_cfg.manager);
            let generator = self.build_generator(&transfer_cfg.generator, &manager)?;
            managers.push(manager.as_base());
            observed.push(manager.as_schedulable());
            observed.push(Rc::clone(&generator));
            self.schedule.push(manager.as_schedulable());
            self.schedule.push(generator);
        }

        for data_gen_cfg in &profile.data_gens {
            let gen = self.build_data_generator(data_gen_cfg)?;
            observed.push(Rc::clone(&gen) as Rc<dyn Schedulable>);
            self.schedule.push(gen);
        }

        let reaper = ReaperCaller::new(
            Rc::clone(&self.rucio),
            profile.reaper.tick_freq,
            profile.reaper.start_tick,
        );
        observed.push(Rc::clone(&reaper) as Rc<dyn Schedulable>);
        self.schedule.push(reaper);

        if !self.clouds.is_empty() {
            let billing = BillingGenerator::new(
                Rc::clone(&self.ctx),
                self.clouds.clone(),
                SECONDS_PER_MONTH,
                SECONDS_PER_MONTH,
            );
            observed.push(Rc::clone(&billing) as Rc<dyn Schedulable>);
            self.schedule.push(billing);
        }

        let heartbeat = Heartbeat::new(
            Rc::clone(&self.rucio),
            managers,
            SECONDS_PER_DAY,
            SECONDS_PER_DAY,
        );
        for schedulable in &observed {
            heartbeat.observe(Rc::downgrade(schedulable));
        }
        self.schedule.push(heartbeat);

        Ok(())
    }

    /// Runs the event loop until the schedule drains or `max_tick` passes.
    pub fn run(&mut self) {
        log::info!("running simulation until tick {}", self.max_tick);
        self.current_tick = 0;

        while let Some(schedulable) = self.schedule.pop() {
            let next_tick = schedulable.sched().next_call_tick();
            assert!(
                next_tick >= self.current_tick,
                "schedulable {} behind the clock",
                schedulable.sched().name()
            );
            if next_tick > self.max_tick {
                schedulable.shutdown(self.current_tick);
                break;
            }
            self.current_tick = next_tick;

            let start = Instant::now();
            schedulable.on_update(self.current_tick);
            schedulable.sched().add_update_duration(start.elapsed());

            if schedulable.sched().next_call_tick() > self.current_tick {
                self.schedule.push(schedulable);
            } else {
                schedulable.shutdown(self.current_tick);
            }
        }

        while let Some(schedulable) = self.schedule.pop() {
            schedulable.shutdown(self.current_tick);
        }

        self.rucio.remove_all_files(self.current_tick);
        self.deletion_insert.flush_all();
        log::info!("simulation finished at tick {}", self.current_tick);
    }
}
