//! Files and replicas.
//!
//! A [File] is the logical data object registered at the catalogue; a
//! [Replica] is one copy of it at a specific storage element. The storage
//! element holds the owning handle, the file keeps weak back-references so
//! replica enumeration stays cheap, and both sides carry a swap-remove index
//! for O(1) deletion.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::common::{Id, Space, Tick};
use crate::infrastructure::storage::StorageElement;

pub type FileRef = Rc<File>;
pub type ReplicaRef = Rc<Replica>;

/// Cancellation hook a transfer attaches to its replicas. The storage
/// element trips it right before the replica is removed; the owning
/// transfer manager observes the tripped tag (or the dead weak handle) on
/// its next pass and records the transfer as failed.
#[derive(Debug, Default)]
pub struct PreRemoveTag {
    tripped: Cell<bool>,
}

impl PreRemoveTag {
    pub fn trip(&self) {
        self.tripped.set(true);
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.get()
    }
}

/// A logical file.
pub struct File {
    id: Id,
    created_at: Tick,
    size: Space,
    expires_at: Cell<Tick>,
    popularity: Cell<u32>,
    index_at_rucio: Cell<usize>,
    replicas: RefCell<Vec<Weak<Replica>>>,
}

impl File {
    pub(crate) fn new(
        id: Id,
        size: Space,
        created_at: Tick,
        lifetime: Tick,
        index_at_rucio: usize,
    ) -> FileRef {
        Rc::new(File {
            id,
            created_at,
            size,
            expires_at: Cell::new(created_at + lifetime),
            popularity: Cell::new(1),
            index_at_rucio: Cell::new(index_at_rucio),
            replicas: RefCell::new(Vec::with_capacity(8)),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn created_at(&self) -> Tick {
        self.created_at
    }

    pub fn size(&self) -> Space {
        self.size
    }

    pub fn expires_at(&self) -> Tick {
        self.expires_at.get()
    }

    /// Forces expiry, used when a file is removed explicitly.
    pub(crate) fn expire_now(&self, now: Tick) {
        self.expires_at.set(now);
    }

    /// Expiry can only move forward.
    pub fn extend_expiration(&self, new_expires_at: Tick) {
        if new_expires_at > self.expires_at.get() {
            self.expires_at.set(new_expires_at);
        }
    }

    pub fn popularity(&self) -> u32 {
        self.popularity.get()
    }

    pub fn set_popularity(&self, popularity: u32) {
        self.popularity.set(popularity.max(1));
    }

    pub(crate) fn index_at_rucio(&self) -> usize {
        self.index_at_rucio.get()
    }

    pub(crate) fn set_index_at_rucio(&self, index: usize) {
        self.index_at_rucio.set(index);
    }

    /// Live replicas of this file.
    pub fn replicas(&self) -> Vec<ReplicaRef> {
        self.replicas
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.borrow().iter().filter(|r| r.strong_count() > 0).count()
    }

    /// The replica of this file at the given storage element, if any.
    pub fn replica_at(&self, storage_element: &StorageElement) -> Option<ReplicaRef> {
        self.replicas
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|replica| replica.storage_element_id() == storage_element.id())
    }

    pub(crate) fn post_create_replica(&self, replica: &ReplicaRef) {
        self.replicas.borrow_mut().push(Rc::downgrade(replica));
    }

    pub(crate) fn pre_remove_replica(&self, replica: &Replica) {
        let mut replicas = self.replicas.borrow_mut();
        let pos = replicas.iter().position(|weak| match weak.upgrade() {
            Some(r) => r.id() == replica.id(),
            None => false,
        });
        match pos {
            Some(idx) => {
                replicas.swap_remove(idx);
            }
            None => panic!("replica {} not registered at file {}", replica.id(), self.id),
        }
    }
}

/// One copy of a file at a storage element.
pub struct Replica {
    id: Id,
    created_at: Tick,
    expires_at: Cell<Tick>,
    cur_size: Cell<Space>,
    index_at_storage_element: Cell<usize>,
    num_staged_in: Cell<u32>,
    usage_counter: Cell<u32>,
    file: FileRef,
    storage_element: Weak<StorageElement>,
    storage_element_id: Id,
    pre_remove_tag: RefCell<Option<Rc<PreRemoveTag>>>,
}

impl Replica {
    pub(crate) fn new(
        id: Id,
        file: FileRef,
        storage_element: &Rc<StorageElement>,
        created_at: Tick,
        index_at_storage_element: usize,
    ) -> ReplicaRef {
        Rc::new(Replica {
            id,
            created_at,
            expires_at: Cell::new(file.expires_at()),
            cur_size: Cell::new(0),
            index_at_storage_element: Cell::new(index_at_storage_element),
            num_staged_in: Cell::new(0),
            usage_counter: Cell::new(0),
            file,
            storage_element: Rc::downgrade(storage_element),
            storage_element_id: storage_element.id(),
            pre_remove_tag: RefCell::new(None),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn created_at(&self) -> Tick {
        self.created_at
    }

    pub fn expires_at(&self) -> Tick {
        self.expires_at.get()
    }

    /// Sets the expiry directly. Only shortening below the file expiry is
    /// allowed this way; extensions must go through [Replica::extend_expiration]
    /// so the file follows.
    pub fn set_expires_at(&self, expires_at: Tick) {
        self.expires_at.set(expires_at);
    }

    /// Extends the replica expiry and lifts the file expiry along with it.
    pub fn extend_expiration(&self, new_expires_at: Tick) {
        if new_expires_at > self.expires_at.get() {
            self.expires_at.set(new_expires_at);
            self.file.extend_expiration(new_expires_at);
        }
    }

    pub fn cur_size(&self) -> Space {
        self.cur_size.get()
    }

    pub fn is_complete(&self) -> bool {
        self.cur_size.get() == self.file.size()
    }

    pub fn file(&self) -> &FileRef {
        &self.file
    }

    pub fn storage_element(&self) -> Rc<StorageElement> {
        self.storage_element
            .upgrade()
            .expect("storage element outlives its replicas")
    }

    pub fn storage_element_id(&self) -> Id {
        self.storage_element_id
    }

    pub fn num_staged_in(&self) -> u32 {
        self.num_staged_in.get()
    }

    pub fn mark_staged_in(&self) {
        self.num_staged_in.set(self.num_staged_in.get() + 1);
    }

    pub fn usage_counter(&self) -> u32 {
        self.usage_counter.get()
    }

    pub fn increment_usage(&self) {
        self.usage_counter.set(self.usage_counter.get() + 1);
    }

    pub(crate) fn index_at_storage_element(&self) -> usize {
        self.index_at_storage_element.get()
    }

    pub(crate) fn set_index_at_storage_element(&self, index: usize) {
        self.index_at_storage_element.set(index);
    }

    /// Installs the transfer cancellation tag. A replica carries at most
    /// one; a newer transfer over the same replica replaces the slot, the
    /// weak handles still invalidate the older transfer on removal.
    pub fn set_pre_remove_tag(&self, tag: Rc<PreRemoveTag>) {
        *self.pre_remove_tag.borrow_mut() = Some(tag);
    }

    pub(crate) fn take_pre_remove_tag(&self) -> Option<Rc<PreRemoveTag>> {
        self.pre_remove_tag.borrow_mut().take()
    }

    /// Grows the replica by up to `amount`, clamped to the file size, and
    /// reports the growth to the owning storage element. Returns the amount
    /// actually applied.
    pub fn increase(self: &Rc<Self>, amount: Space, now: Tick) -> Space {
        let increment = amount.min(self.file.size() - self.cur_size.get());
        self.cur_size.set(self.cur_size.get() + increment);
        self.storage_element().on_increase_replica(self, increment, now);
        increment
    }
}
