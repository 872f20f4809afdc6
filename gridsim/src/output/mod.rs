//! Output sink.
//!
//! The simulation produces rows (transfers, traces, deleted files, bills)
//! far faster than any real store can absorb them synchronously, so the sink
//! decouples the two: the simulation thread fills [ValuesContainer]s from
//! prepared insert statements and pushes them onto a bounded channel; a
//! single consumer thread drains the channel, merges containers that belong
//! to the same statement and hands them to a [Database] implementation.
//!
//! Topology rows (Sites, StorageElements, NetworkLinks) are written directly
//! through [Output::insert_row] before the consumer starts, exactly once.
//!
//! The producer side never drops data: when the channel is full,
//! [Output::queue_inserts] sleeps briefly and retries.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;

/// How many containers the consumer merges before flushing a batch.
const MERGE_LIMIT: usize = 4096;
/// Producer back-off while the queue is full.
const FULL_QUEUE_BACKOFF: Duration = Duration::from_millis(10);
/// Consumer idle sleep between drain rounds.
const CONSUMER_IDLE: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("database rejected query: {0}")]
    Query(String),
    #[error("output sink already shut down")]
    ShutDown,
    #[error("operation not allowed while the consumer is running")]
    ConsumerRunning,
}

/// A single typed value of an insert row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    F64(f64),
    I32(i32),
    U32(u32),
    U64(u64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::F64(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "'{}'", v),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

/// Template of an insert statement, shared by every container created from
/// it. The statement text keeps the backend's own syntax; the sink only
/// cares about identity and parameter count.
#[derive(Debug)]
pub struct PreparedInsert {
    statement: Arc<str>,
    num_params: usize,
}

impl PreparedInsert {
    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }

    /// Creates an empty container for rows of this statement.
    pub fn values_container(&self, reserve_values: usize) -> ValuesContainer {
        ValuesContainer {
            statement: Arc::clone(&self.statement),
            num_params: self.num_params,
            values: Vec::with_capacity(reserve_values),
        }
    }
}

/// A batch of values for one insert statement. Values are appended in row
/// order; a full row consists of `num_params` values.
#[derive(Debug)]
pub struct ValuesContainer {
    statement: Arc<str>,
    num_params: usize,
    values: Vec<Value>,
}

impl ValuesContainer {
    pub fn add_value<V: Into<Value>>(&mut self, value: V) {
        self.values.push(value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn num_rows(&self) -> usize {
        debug_assert!(self.num_params > 0 && self.values.len() % self.num_params == 0);
        self.values.len() / self.num_params
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Merges `other` into `self` when both target the same statement;
    /// returns `other` back otherwise.
    pub fn merge_if_possible(&mut self, other: ValuesContainer) -> Result<(), ValuesContainer> {
        if self.statement == other.statement {
            self.values.extend(other.values);
            Ok(())
        } else {
            Err(other)
        }
    }
}

/// Backend abstraction. Implementations run on the consumer thread.
pub trait Database: Send {
    fn open(&mut self, _params: &str) -> Result<(), OutputError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), OutputError> {
        Ok(())
    }

    /// Executes a raw statement (table creation, init/shutdown queries,
    /// direct row inserts).
    fn execute(&mut self, query: &str) -> Result<(), OutputError>;

    /// Inserts a batch, returning the number of rows written.
    fn insert_batch(&mut self, batch: &ValuesContainer) -> Result<usize, OutputError>;
}

/// Backend that discards everything and only keeps counters. Useful for
/// profiling the simulation itself.
#[derive(Debug, Default)]
pub struct DummyDatabase {
    num_queries: u64,
    num_rows: u64,
}

impl Database for DummyDatabase {
    fn close(&mut self) -> Result<(), OutputError> {
        log::info!(
            "dummy database: {} queries, {} rows discarded",
            self.num_queries,
            self.num_rows
        );
        Ok(())
    }

    fn execute(&mut self, _query: &str) -> Result<(), OutputError> {
        self.num_queries += 1;
        Ok(())
    }

    fn insert_batch(&mut self, batch: &ValuesContainer) -> Result<usize, OutputError> {
        let rows = batch.num_rows();
        self.num_rows += rows as u64;
        Ok(rows)
    }
}

/// Captured state of a [MemoryDatabase], shareable across threads so tests
/// can inspect rows after the consumer finished.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub queries: Mutex<Vec<String>>,
    pub batches: Mutex<Vec<(String, Vec<Value>)>>,
}

impl MemoryStore {
    /// All rows of the statement whose text contains `table`, split into
    /// rows of the statement's parameter count.
    pub fn rows_for(&self, table: &str, num_params: usize) -> Vec<Vec<Value>> {
        let batches = self.batches.lock();
        let mut rows = Vec::new();
        for (statement, values) in batches.iter() {
            if statement.contains(table) {
                for chunk in values.chunks(num_params) {
                    rows.push(chunk.to_vec());
                }
            }
        }
        rows
    }
}

/// In-memory capturing backend used by the integration tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryDatabase {
    store: Arc<MemoryStore>,
}

impl MemoryDatabase {
    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }
}

impl Database for MemoryDatabase {
    fn execute(&mut self, query: &str) -> Result<(), OutputError> {
        self.store.queries.lock().push(query.to_owned());
        Ok(())
    }

    fn insert_batch(&mut self, batch: &ValuesContainer) -> Result<usize, OutputError> {
        let rows = batch.num_rows();
        self.store
            .batches
            .lock()
            .push((batch.statement().to_owned(), batch.values().to_vec()));
        Ok(rows)
    }
}

/// The sink itself: owns the channel ends until the consumer is started and
/// the database until it is moved onto the consumer thread.
pub struct Output {
    tx: Option<Sender<ValuesContainer>>,
    rx: Option<Receiver<ValuesContainer>>,
    db: Option<Box<dyn Database>>,
    consumer: Option<JoinHandle<(u64, Box<dyn Database>)>>,
    pub init_queries: Vec<String>,
    pub shutdown_queries: Vec<String>,
}

impl Output {
    pub fn new(db: Box<dyn Database>, queue_len: usize) -> Output {
        let (tx, rx) = bounded(queue_len.max(1));
        Output {
            tx: Some(tx),
            rx: Some(rx),
            db: Some(db),
            consumer: None,
            init_queries: Vec::new(),
            shutdown_queries: Vec::new(),
        }
    }

    fn db_mut(&mut self) -> Result<&mut Box<dyn Database>, OutputError> {
        self.db.as_mut().ok_or(OutputError::ConsumerRunning)
    }

    /// Runs the configured init queries. Must precede [Output::start_consumer].
    pub fn initialise(&mut self) -> Result<(), OutputError> {
        let queries = std::mem::take(&mut self.init_queries);
        let db = self.db_mut()?;
        for query in &queries {
            db.execute(query)?;
        }
        Ok(())
    }

    pub fn create_table(&mut self, name: &str, columns: &str) -> Result<(), OutputError> {
        let query = format!("CREATE TABLE {}({});", name, columns);
        self.db_mut()?.execute(&query)
    }

    pub fn insert_row(&mut self, table: &str, row: &str) -> Result<(), OutputError> {
        let query = format!("INSERT INTO {} VALUES ({});", table, row);
        self.db_mut()?.execute(&query)
    }

    pub fn prepare_insert(
        &self,
        query_tpl: &str,
        num_wildcards: usize,
        wildcard: char,
    ) -> Rc<PreparedInsert> {
        debug_assert!(
            query_tpl.matches(wildcard).count() == num_wildcards
                || !query_tpl.contains(wildcard),
            "wildcard count mismatch in insert template"
        );
        Rc::new(PreparedInsert {
            statement: Arc::from(query_tpl),
            num_params: num_wildcards,
        })
    }

    /// Queues a container for the consumer. Empty containers are dropped.
    /// Applies sleep-spin back-pressure when the queue is full; never loses
    /// a non-empty container while the sink is alive.
    pub fn queue_inserts(&self, container: ValuesContainer) {
        if container.is_empty() {
            return;
        }
        let tx = match &self.tx {
            Some(tx) => tx,
            None => {
                log::error!("output sink already shut down, dropping batch");
                return;
            }
        };
        let mut pending = container;
        loop {
            match tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    pending = back;
                    thread::sleep(FULL_QUEUE_BACKOFF);
                }
                Err(TrySendError::Disconnected(_)) => {
                    log::error!("output consumer gone, dropping batch");
                    return;
                }
            }
        }
    }

    /// Starts the consumer thread. Direct queries are rejected afterwards.
    pub fn start_consumer(&mut self) -> Result<(), OutputError> {
        if self.consumer.is_some() {
            return Err(OutputError::ConsumerRunning);
        }
        let rx = self.rx.take().ok_or(OutputError::ShutDown)?;
        let mut db = self.db.take().ok_or(OutputError::ShutDown)?;
        self.consumer = Some(thread::spawn(move || {
            let rows = consumer_loop(&rx, db.as_mut());
            (rows, db)
        }));
        Ok(())
    }

    /// Waits for the consumer to drain, runs the shutdown queries and closes
    /// the database. Idempotent.
    pub fn shutdown(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.consumer.take() {
            log::info!("waiting for remaining inserts...");
            match handle.join() {
                Ok((rows, db)) => {
                    log::info!("output consumer wrote {} rows", rows);
                    self.db = Some(db);
                }
                Err(_) => log::error!("output consumer panicked"),
            }
        }
        if let Some(db) = self.db.as_mut() {
            for query in &self.shutdown_queries {
                if let Err(err) = db.execute(query) {
                    log::error!("shutdown query failed: {}", err);
                }
            }
            self.shutdown_queries.clear();
            if let Err(err) = db.close() {
                log::error!("closing database failed: {}", err);
            }
        }
        self.db = None;
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consumer_loop(rx: &Receiver<ValuesContainer>, db: &mut dyn Database) -> u64 {
    let mut rows_written = 0u64;
    loop {
        let mut merged: Vec<ValuesContainer> = Vec::new();
        let mut num_taken = 0usize;
        let mut disconnected = false;
        while num_taken < MERGE_LIMIT {
            match rx.try_recv() {
                Ok(container) => {
                    num_taken += 1;
                    let mut pending = Some(container);
                    for slot in merged.iter_mut() {
                        match pending.take() {
                            Some(c) => match slot.merge_if_possible(c) {
                                Ok(()) => break,
                                Err(back) => pending = Some(back),
                            },
                            None => break,
                        }
                    }
                    if let Some(rest) = pending {
                        merged.push(rest);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        for container in &merged {
            match db.insert_batch(container) {
                Ok(rows) => rows_written += rows as u64,
                Err(err) => log::error!("insert batch failed: {}", err),
            }
        }

        if disconnected {
            return rows_written;
        }
        if num_taken == 0 {
            thread::sleep(CONSUMER_IDLE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(output: &Output) -> Rc<PreparedInsert> {
        output.prepare_insert(
            "COPY Transfers(id, traffic) FROM STDIN with(FORMAT csv);",
            2,
            '?',
        )
    }

    #[test]
    fn containers_merge_only_for_same_statement() {
        let output = Output::new(Box::new(DummyDatabase::default()), 8);
        let insert_a = prepared(&output);
        let insert_b = output.prepare_insert("COPY Bills(a, b) FROM STDIN;", 2, '?');

        let mut a = insert_a.values_container(4);
        a.add_value(1u64);
        a.add_value(2u64);
        let mut a2 = insert_a.values_container(4);
        a2.add_value(3u64);
        a2.add_value(4u64);
        let mut b = insert_b.values_container(2);
        b.add_value(5u64);
        b.add_value(6u64);

        assert!(a.merge_if_possible(a2).is_ok());
        assert_eq!(a.num_rows(), 2);
        assert!(a.merge_if_possible(b).is_err());
    }

    #[test]
    fn consumer_receives_all_queued_batches() {
        let db = MemoryDatabase::default();
        let store = db.store();
        let mut output = Output::new(Box::new(db), 4);
        let insert = prepared(&output);
        output.start_consumer().unwrap();

        for i in 0..32u64 {
            let mut container = insert.values_container(2);
            container.add_value(i);
            container.add_value(i * 10);
            output.queue_inserts(container);
        }
        output.shutdown();

        let rows = store.rows_for("Transfers", 2);
        assert_eq!(rows.len(), 32);
        assert_eq!(rows[0][0], Value::U64(0));
        assert_eq!(rows[31][1], Value::U64(310));
    }

    #[test]
    fn empty_containers_are_not_queued() {
        let db = MemoryDatabase::default();
        let store = db.store();
        let mut output = Output::new(Box::new(db), 4);
        let insert = prepared(&output);
        output.start_consumer().unwrap();
        output.queue_inserts(insert.values_container(0));
        output.shutdown();
        assert!(store.batches.lock().is_empty());
    }

    #[test]
    fn direct_queries_fail_once_consumer_runs() {
        let mut output = Output::new(Box::new(DummyDatabase::default()), 4);
        output.create_table("Sites", "id, name").unwrap();
        output.insert_row("Sites", "1,'site'").unwrap();
        output.start_consumer().unwrap();
        assert!(output.create_table("Files", "id").is_err());
        assert!(output.insert_row("Files", "1").is_err());
    }
}
