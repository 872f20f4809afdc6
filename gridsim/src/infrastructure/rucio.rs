//! The data catalogue.
//!
//! [Rucio] owns every file of the simulation and the grid sites. It creates
//! files, cascades file removal through all replicas and hosts the reaper
//! sweep that evicts whatever passed its expiry.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::common::{Ctx, Space, Tick};
use crate::infrastructure::file::{File, FileRef, ReplicaRef};
use crate::infrastructure::site::{Site, SiteKind, SiteRef};
use crate::infrastructure::storage::StorageElementRef;

/// Actions broadcast by the catalogue. Listeners are held weakly.
pub trait FileListener {
    fn post_create_file(&self, _file: &FileRef, _now: Tick) {}
    fn pre_remove_file(&self, _file: &FileRef, _now: Tick) {}
}

pub struct Rucio {
    ctx: Ctx,
    files: RefCell<Vec<FileRef>>,
    grid_sites: RefCell<Vec<SiteRef>>,
    listeners: RefCell<Vec<Weak<dyn FileListener>>>,
}

impl Rucio {
    pub fn new(ctx: Ctx) -> Rc<Rucio> {
        Rc::new(Rucio {
            ctx,
            files: RefCell::new(Vec::new()),
            grid_sites: RefCell::new(Vec::new()),
            listeners: RefCell::new(Vec::new()),
        })
    }

    pub fn add_file_listener(&self, listener: Weak<dyn FileListener>) {
        self.listeners.borrow_mut().push(listener);
    }

    fn for_each_listener(&self, mut f: impl FnMut(&Rc<dyn FileListener>)) {
        let live: Vec<_> = {
            let mut listeners = self.listeners.borrow_mut();
            listeners.retain(|weak| weak.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in &live {
            f(listener);
        }
    }

    pub fn num_files(&self) -> usize {
        self.files.borrow().len()
    }

    pub fn files(&self) -> Vec<FileRef> {
        self.files.borrow().clone()
    }

    /// Reserves file slots ahead of a bulk generation round.
    pub fn reserve_file_space(&self, amount: usize) {
        self.files.borrow_mut().reserve(amount);
    }

    /// Registers a new file with the given size and lifetime.
    pub fn create_file(&self, size: Space, now: Tick, lifetime: Tick) -> FileRef {
        let file = {
            let mut files = self.files.borrow_mut();
            let file = File::new(self.ctx.ids.next(), size, now, lifetime, files.len());
            files.push(Rc::clone(&file));
            file
        };
        self.for_each_listener(|listener| listener.post_create_file(&file, now));
        file
    }

    /// Removes a file and every replica of it. Listener order: file
    /// listeners first, then each replica's own pre-remove path as the
    /// storage elements drop them.
    pub fn remove_file(&self, file: &FileRef, now: Tick) {
        file.expire_now(now);
        self.for_each_listener(|listener| listener.pre_remove_file(file, now));

        for replica in file.replicas() {
            replica.storage_element().remove_replica(&replica, now, false);
        }

        let mut files = self.files.borrow_mut();
        let idx = file.index_at_rucio();
        assert!(idx < files.len(), "file already removed from catalogue");
        debug_assert_eq!(files[idx].id(), file.id());
        files.swap_remove(idx);
        if idx < files.len() {
            files[idx].set_index_at_rucio(idx);
        }
    }

    /// Drops every file, replicas included. Called once when the simulation
    /// shuts down.
    pub fn remove_all_files(&self, now: Tick) {
        loop {
            let file = match self.files.borrow().last() {
                Some(file) => Rc::clone(file),
                None => break,
            };
            self.remove_file(&file, now);
        }
    }

    /// Replicas of `file` that are past their expiry, without removing them.
    /// Generators use this to take custody of the eviction.
    pub fn extract_expired_replicas(&self, file: &FileRef, now: Tick) -> Vec<ReplicaRef> {
        file.replicas()
            .into_iter()
            .filter(|replica| replica.expires_at() <= now)
            .collect()
    }

    /// Removes the expired replicas of `file`; removes the file as well if
    /// no replica is left. Returns the number of replicas removed.
    pub fn remove_expired_replicas_from_file(&self, file: &FileRef, now: Tick) -> usize {
        let mut removed = 0;
        for replica in file.replicas() {
            if replica.expires_at() <= now {
                replica.storage_element().remove_replica(&replica, now, true);
                removed += 1;
            }
        }
        if removed > 0 && file.replicas().is_empty() {
            self.remove_file(file, now);
        }
        removed
    }

    /// One reaper sweep: removes every file whose expiry passed, cascading
    /// through its replicas. Returns the number of files removed.
    pub fn run_reaper(&self, now: Tick) -> usize {
        let expired: Vec<FileRef> = self
            .files
            .borrow()
            .iter()
            .filter(|file| file.expires_at() <= now)
            .map(Rc::clone)
            .collect();

        for file in &expired {
            self.remove_file(file, now);
        }
        if !expired.is_empty() {
            log::debug!("reaper removed {} files at tick {}", expired.len(), now);
        }
        expired.len()
    }

    pub fn create_grid_site(
        &self,
        name: String,
        location_name: String,
        multi_location_idx: u8,
    ) -> SiteRef {
        let site = Site::new(
            &self.ctx,
            name,
            location_name,
            multi_location_idx,
            SiteKind::Grid,
        );
        self.grid_sites.borrow_mut().push(Rc::clone(&site));
        site
    }

    pub fn grid_sites(&self) -> Vec<SiteRef> {
        self.grid_sites.borrow().clone()
    }

    pub fn storage_element_by_name(&self, name: &str) -> Option<StorageElementRef> {
        self.grid_sites
            .borrow()
            .iter()
            .flat_map(|site| site.storage_elements())
            .find(|element| element.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::random::ValueGen;
    use crate::common::testutil::test_ctx;

    fn setup() -> (Ctx, Rc<Rucio>, StorageElementRef) {
        let ctx = test_ctx();
        let rucio = Rucio::new(Rc::clone(&ctx));
        let site = rucio.create_grid_site("site".into(), "somewhere".into(), 0);
        let se = site.create_storage_element(
            &ctx,
            "se".into(),
            true,
            0,
            ValueGen::fixed(0.0),
            None,
        );
        (ctx, rucio, se)
    }

    #[test]
    fn reaper_removes_expired_files_and_frees_storage() {
        let (ctx, rucio, se) = setup();
        for _ in 0..5 {
            let file = rucio.create_file(100, 0, 10);
            let replica = se.create_replica(&ctx, &file, 0).unwrap();
            replica.increase(100, 0);
        }
        assert_eq!(se.used(), 500);

        assert_eq!(rucio.run_reaper(5), 0);
        assert_eq!(rucio.num_files(), 5);

        assert_eq!(rucio.run_reaper(15), 5);
        assert_eq!(rucio.num_files(), 0);
        assert_eq!(se.used(), 0);
        assert_eq!(se.allocated(), 0);
        assert_eq!(se.num_replicas(), 0);
    }

    #[test]
    fn reaper_keeps_unexpired_files() {
        let (_ctx, rucio, _se) = setup();
        rucio.create_file(10, 0, 10);
        rucio.create_file(10, 0, 100);
        assert_eq!(rucio.run_reaper(50), 1);
        assert_eq!(rucio.num_files(), 1);
        assert_eq!(rucio.files()[0].expires_at(), 100);
    }

    #[test]
    fn remove_file_cascades_over_all_replicas() {
        let (ctx, rucio, se) = setup();
        let site = rucio.grid_sites()[0].clone();
        let other = site.create_storage_element(
            &ctx,
            "other".into(),
            true,
            0,
            ValueGen::fixed(0.0),
            None,
        );
        let file = rucio.create_file(10, 0, 100);
        se.create_replica(&ctx, &file, 0).unwrap();
        other.create_replica(&ctx, &file, 0).unwrap();

        rucio.remove_file(&file, 1);
        assert_eq!(se.num_replicas(), 0);
        assert_eq!(other.num_replicas(), 0);
        assert_eq!(rucio.num_files(), 0);
    }

    #[test]
    fn expired_replica_extraction_leaves_replicas_in_place() {
        let (ctx, rucio, se) = setup();
        let file = rucio.create_file(10, 0, 100);
        let replica = se.create_replica(&ctx, &file, 0).unwrap();
        replica.set_expires_at(5);

        let expired = rucio.extract_expired_replicas(&file, 10);
        assert_eq!(expired.len(), 1);
        assert_eq!(se.num_replicas(), 1);
    }

    #[test]
    fn removing_last_expired_replica_removes_the_file() {
        let (ctx, rucio, se) = setup();
        let file = rucio.create_file(10, 0, 100);
        let replica = se.create_replica(&ctx, &file, 0).unwrap();
        replica.set_expires_at(5);

        assert_eq!(rucio.remove_expired_replicas_from_file(&file, 10), 1);
        assert_eq!(rucio.num_files(), 0);
        assert_eq!(se.num_replicas(), 0);
    }

    #[test]
    fn swap_remove_keeps_file_indices_consistent() {
        let (_ctx, rucio, _se) = setup();
        let a = rucio.create_file(1, 0, 100);
        let _b = rucio.create_file(1, 0, 100);
        let c = rucio.create_file(1, 0, 100);

        rucio.remove_file(&a, 1);
        // c swapped into a's slot
        assert_eq!(c.index_at_rucio(), 0);
        rucio.remove_file(&c, 1);
        assert_eq!(rucio.num_files(), 1);
    }

    #[test]
    #[should_panic(expected = "already removed")]
    fn removing_a_file_twice_is_a_hard_error() {
        let (_ctx, rucio, _se) = setup();
        let file = rucio.create_file(1, 0, 100);
        rucio.remove_file(&file, 1);
        rucio.remove_file(&file, 2);
    }

    #[test]
    fn storage_element_lookup_by_name() {
        let (_ctx, rucio, se) = setup();
        assert_eq!(rucio.storage_element_by_name("se").unwrap().id(), se.id());
        assert!(rucio.storage_element_by_name("nope").is_none());
    }
}
