//! Transfer generators: the policies deciding which replica moves where.
//!
//! Every generator is a [Schedulable](crate::sim::Schedulable) that creates
//! transfers through one of the transfer managers. This module also hosts
//! the deletion listeners that write Files and Replicas rows to the sink
//! right before the entities disappear.

mod cached_src;
mod cloud_buffer;
mod fixed;
mod hcdc;
mod job_io;
mod job_slot;

pub use cached_src::{CacheElement, CachedSrcTransferGen};
pub use cloud_buffer::{CloudBufferInfo, CloudBufferTransferGen};
pub use fixed::{FixedTarget, FixedTransferGen};
pub use hcdc::HcdcTransferGen;
pub use job_io::{JobIoSite, JobIoTransferGen};
pub use job_slot::{JobSlotInfo, JobSlotTransferGen};

use std::cell::RefCell;
use std::rc::Rc;

use crate::common::{Ctx, Tick};
use crate::infrastructure::{FileListener, FileRef, ReplicaRef, StorageElementListener};
use crate::output::{PreparedInsert, ValuesContainer};

pub(crate) const FILES_INSERT: &str =
    "COPY Files(id, createdAt, expiredAt, filesize, popularity) FROM STDIN with(FORMAT csv);";
pub(crate) const REPLICAS_INSERT: &str =
    "COPY Replicas(id, fileId, storageElementId, createdAt, expiredAt) FROM STDIN with(FORMAT csv);";

fn add_file_row(container: &mut ValuesContainer, file: &FileRef) {
    container.add_value(file.id());
    container.add_value(file.created_at());
    container.add_value(file.expires_at());
    container.add_value(file.size());
    container.add_value(file.popularity());
}

fn add_replica_row(container: &mut ValuesContainer, replica: &ReplicaRef) {
    container.add_value(replica.id());
    container.add_value(replica.file().id());
    container.add_value(replica.storage_element_id());
    container.add_value(replica.created_at());
    container.add_value(replica.expires_at());
}

/// Writes one row per removed file and replica, immediately.
pub struct OnDeletionInsert {
    ctx: Ctx,
    file_insert: Rc<PreparedInsert>,
    replica_insert: Rc<PreparedInsert>,
}

impl OnDeletionInsert {
    pub fn new(ctx: Ctx) -> Rc<Self> {
        let output = ctx.output.borrow();
        let file_insert = output.prepare_insert(FILES_INSERT, 5, '?');
        let replica_insert = output.prepare_insert(REPLICAS_INSERT, 5, '?');
        drop(output);
        Rc::new(OnDeletionInsert {
            ctx,
            file_insert,
            replica_insert,
        })
    }
}

impl FileListener for OnDeletionInsert {
    fn pre_remove_file(&self, file: &FileRef, _now: Tick) {
        let mut container = self.file_insert.values_container(5);
        add_file_row(&mut container, file);
        self.ctx.output.borrow().queue_inserts(container);
    }
}

impl StorageElementListener for OnDeletionInsert {
    fn pre_remove_replica(&self, replica: &ReplicaRef, _now: Tick) {
        let mut container = self.replica_insert.values_container(5);
        add_replica_row(&mut container, replica);
        self.ctx.output.borrow().queue_inserts(container);
    }
}

/// Like [OnDeletionInsert] but buffers rows and flushes in batches, which
/// is what long runs with frequent reaping want.
pub struct BufferedOnDeletionInsert {
    ctx: Ctx,
    file_insert: Rc<PreparedInsert>,
    replica_insert: Rc<PreparedInsert>,
    file_buffer: RefCell<Option<ValuesContainer>>,
    replica_buffer: RefCell<Option<ValuesContainer>>,
}

/// Rows buffered per entity kind before a flush.
const DELETE_BUFFER_ROWS: usize = 5000;

impl BufferedOnDeletionInsert {
    pub fn new(ctx: Ctx) -> Rc<Self> {
        let output = ctx.output.borrow();
        let file_insert = output.prepare_insert(FILES_INSERT, 5, '?');
        let replica_insert = output.prepare_insert(REPLICAS_INSERT, 5, '?');
        drop(output);
        Rc::new(BufferedOnDeletionInsert {
            ctx,
            file_insert,
            replica_insert,
            file_buffer: RefCell::new(None),
            replica_buffer: RefCell::new(None),
        })
    }

    fn flush(&self, buffer: &RefCell<Option<ValuesContainer>>) {
        if let Some(container) = buffer.borrow_mut().take() {
            self.ctx.output.borrow().queue_inserts(container);
        }
    }

    pub fn flush_all(&self) {
        self.flush(&self.file_buffer);
        self.flush(&self.replica_buffer);
    }
}

impl Drop for BufferedOnDeletionInsert {
    fn drop(&mut self) {
        self.flush_all();
    }
}

impl FileListener for BufferedOnDeletionInsert {
    fn pre_remove_file(&self, file: &FileRef, _now: Tick) {
        let mut buffer = self.file_buffer.borrow_mut();
        let container = buffer
            .get_or_insert_with(|| self.file_insert.values_container(DELETE_BUFFER_ROWS * 5));
        add_file_row(container, file);
        let full = container.len() >= DELETE_BUFFER_ROWS * 5;
        drop(buffer);
        if full {
            self.flush(&self.file_buffer);
        }
    }
}

impl StorageElementListener for BufferedOnDeletionInsert {
    fn pre_remove_replica(&self, replica: &ReplicaRef, _now: Tick) {
        let mut buffer = self.replica_buffer.borrow_mut();
        let container = buffer
            .get_or_insert_with(|| self.replica_insert.values_container(DELETE_BUFFER_ROWS * 5));
        add_replica_row(container, replica);
        let full = container.len() >= DELETE_BUFFER_ROWS * 5;
        drop(buffer);
        if full {
            self.flush(&self.replica_buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::random::ValueGen;
    use crate::common::SimContext;
    use crate::infrastructure::Rucio;
    use crate::output::{MemoryDatabase, Output};

    #[test]
    fn deletion_listener_emits_rows_before_removal() {
        let db = MemoryDatabase::default();
        let store = db.store();
        let mut output = Output::new(Box::new(db), 64);
        output.start_consumer().unwrap();
        let output = Rc::new(RefCell::new(output));
        let ctx = SimContext::new(Rc::clone(&output), Some(1));

        let rucio = Rucio::new(Rc::clone(&ctx));
        let site = rucio.create_grid_site("site".into(), "eu".into(), 0);
        let se = site.create_storage_element(
            &ctx,
            "se".into(),
            true,
            0,
            ValueGen::fixed(0.0),
            None,
        );

        let listener = OnDeletionInsert::new(Rc::clone(&ctx));
        let as_file_listener: Rc<dyn FileListener> = listener.clone();
        rucio.add_file_listener(Rc::downgrade(&as_file_listener));
        let as_se_listener: Rc<dyn StorageElementListener> = listener.clone();
        se.add_listener(Rc::downgrade(&as_se_listener));

        let file = rucio.create_file(100, 0, 10);
        se.create_replica(&ctx, &file, 0).unwrap();
        rucio.run_reaper(20);

        output.borrow_mut().shutdown();
        assert_eq!(store.rows_for("Files", 5).len(), 1);
        assert_eq!(store.rows_for("Replicas", 5).len(), 1);
    }
}
