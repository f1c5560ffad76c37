//! In-memory mirror of destination table schemas
//!
//! Entries are fetched or created lazily, then only grown as patches are
//! applied. Out-of-band changes to the destination are not detected; call
//! [`SchemaCache::invalidate`] to force a refetch on the next fact.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{SchemaDiff, Table};

#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: Mutex<HashMap<String, Table>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Table> {
        self.lock().get(name).cloned()
    }

    pub fn insert(&self, table: Table) {
        self.lock().insert(table.name().to_string(), table);
    }

    /// Fold an applied diff into the cached table and return the result
    ///
    /// Returns `None` when the table is not cached (e.g. invalidated while
    /// the patch was in flight); the next fact refetches it.
    pub fn merge_diff(&self, diff: &SchemaDiff) -> Option<Table> {
        let mut tables = self.lock();
        let table = tables.get_mut(diff.table())?;
        table.merge(diff);
        Some(table.clone())
    }

    /// Drop one cached table; returns whether it was cached
    pub fn invalidate(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    pub fn invalidate_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Every mutation is a single map operation, so a poisoned map is still consistent
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
