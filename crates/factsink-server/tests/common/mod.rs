//! Shared helpers for factsink-server integration tests
//!
//! [`RecordingAdapter`] stands in for a real destination: it keeps an
//! in-memory set of tables, records every call in order and can be told to
//! fail inserts or patches.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use factsink_common::Fact;
use factsink_server::adapter::SinkAdapter;
use factsink_server::error::AdapterError;
use factsink_server::flatten::JsonFlattener;
use factsink_server::queue::{DurableQueue, QueueOptions};
use factsink_server::schema::{Columns, SchemaDiff, Table};
use factsink_server::sink::DurableSink;
use tokio_util::sync::CancellationToken;

/// Initialize test logging once per test binary
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("factsink_server=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// One adapter call as observed by [`RecordingAdapter`]
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    GetSchema(String),
    CreateDestination,
    CreateTable(Table),
    PatchTable(SchemaDiff),
    Insert { table: Table, fact: Fact },
    Close,
}

/// In-memory destination that records every call
#[derive(Default)]
pub struct RecordingAdapter {
    calls: Mutex<Vec<Call>>,
    tables: Mutex<HashMap<String, Columns>>,
    delivered: Mutex<Vec<Fact>>,
    unreachable: AtomicBool,
    failing_inserts: AtomicUsize,
    failing_patches: AtomicUsize,
    fail_close: Mutex<Option<String>>,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` inserts
    pub fn fail_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` patches
    pub fn fail_patches(&self, n: usize) {
        self.failing_patches.store(n, Ordering::SeqCst);
    }

    /// Make `create_destination` fail
    pub fn unreachable(self) -> Self {
        self.unreachable.store(true, Ordering::SeqCst);
        self
    }

    pub fn fail_close(&self, message: &str) {
        *self.fail_close.lock().unwrap() = Some(message.to_string());
    }

    /// Pretend `table` already exists in the destination
    pub fn with_table(self, table: Table) -> Self {
        self.tables
            .lock()
            .unwrap()
            .insert(table.name().to_string(), table.columns().clone());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than `GetSchema`, `CreateDestination` and `Close`
    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| {
                matches!(
                    call,
                    Call::CreateTable(_) | Call::PatchTable(_) | Call::Insert { .. }
                )
            })
            .collect()
    }

    /// Facts whose insert succeeded, in order
    pub fn inserted(&self) -> Vec<Fact> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn schema_fetches(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::GetSchema(_)))
            .count()
    }

    pub fn insert_attempts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Insert { .. }))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SinkAdapter for RecordingAdapter {
    async fn get_schema(&self, table: &str) -> Result<Table, AdapterError> {
        self.record(Call::GetSchema(table.to_string()));
        Ok(match self.tables.lock().unwrap().get(table) {
            Some(columns) => Table::new(table, columns.clone()),
            None => Table::absent(table),
        })
    }

    async fn create_destination(&self) -> Result<(), AdapterError> {
        self.record(Call::CreateDestination);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AdapterError::Destination("destination unreachable".into()));
        }
        Ok(())
    }

    async fn create_table(&self, table: &Table) -> Result<(), AdapterError> {
        self.record(Call::CreateTable(table.clone()));
        self.tables
            .lock()
            .unwrap()
            .insert(table.name().to_string(), table.columns().clone());
        Ok(())
    }

    async fn patch_table(&self, diff: &SchemaDiff) -> Result<(), AdapterError> {
        self.record(Call::PatchTable(diff.clone()));
        if Self::take_failure(&self.failing_patches) {
            return Err(AdapterError::Destination("patch refused".into()));
        }
        let mut tables = self.tables.lock().unwrap();
        let columns = tables.entry(diff.table().to_string()).or_default();
        for (name, column_type) in diff.columns() {
            columns.entry(name.clone()).or_insert(*column_type);
        }
        Ok(())
    }

    async fn insert(&self, table: &Table, fact: &Fact) -> Result<(), AdapterError> {
        self.record(Call::Insert {
            table: table.clone(),
            fact: fact.clone(),
        });
        if Self::take_failure(&self.failing_inserts) {
            return Err(AdapterError::Destination("insert refused".into()));
        }
        self.delivered.lock().unwrap().push(fact.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.record(Call::Close);
        match self.fail_close.lock().unwrap().clone() {
            Some(message) => Err(AdapterError::Destination(message)),
            None => Ok(()),
        }
    }
}

/// Durable sink named `test` writing to `events` through `adapter`
pub async fn open_sink(
    adapter: Arc<RecordingAdapter>,
    queue_dir: &Path,
    shutdown: &CancellationToken,
) -> DurableSink<RecordingAdapter> {
    let queue = DurableQueue::open(queue_dir, QueueOptions::default()).unwrap();
    DurableSink::open(
        "test",
        adapter,
        Arc::new(JsonFlattener::fixed("events")),
        queue,
        shutdown,
    )
    .await
    .unwrap()
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Run `future` with a five second limit
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .unwrap_or_else(|_| panic!("operation did not finish in time"))
}
