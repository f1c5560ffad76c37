//! Table shapes and the additive diff/merge between them
//!
//! A destination's columns only ever grow: [`Table::diff`] reports the
//! columns a candidate shape needs that the authoritative shape lacks, and
//! [`Table::merge`] folds an applied diff back in without touching existing
//! columns.

pub mod cache;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use cache::SchemaCache;

/// Semantic column type; adapters map each tag to a native type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    /// Nested or variant data kept as a JSON document
    Json,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column name to type
pub type Columns = BTreeMap<String, ColumnType>;

/// Known or candidate shape of one destination relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    name: String,
    columns: Columns,
    exists: bool,
}

impl Table {
    /// A table that exists; a zero-column table still exists
    pub fn new(name: impl Into<String>, columns: Columns) -> Self {
        let name = name.into();
        let exists = !name.is_empty();
        Self {
            name,
            columns,
            exists,
        }
    }

    /// Marker for "no such table" (or "nothing to store")
    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Columns::new(),
            exists: false,
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<ColumnType> {
        self.columns.get(name).copied()
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Columns of `candidate` that are missing from `self` by name
    ///
    /// A same-named column with a different type is not part of the diff;
    /// the adapter decides how to store such values.
    pub fn diff(&self, candidate: &Table) -> SchemaDiff {
        let columns = candidate
            .columns
            .iter()
            .filter(|(name, _)| !self.columns.contains_key(*name))
            .map(|(name, column_type)| (name.clone(), *column_type))
            .collect();

        SchemaDiff {
            table: candidate.name.clone(),
            columns,
        }
    }

    /// Union in the columns of an applied diff; existing columns keep their type
    pub fn merge(&mut self, diff: &SchemaDiff) {
        for (name, column_type) in &diff.columns {
            self.columns.entry(name.clone()).or_insert(*column_type);
        }
    }
}

/// Columns a candidate shape requires beyond the authoritative one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDiff {
    table: String,
    columns: Columns,
}

impl SchemaDiff {
    pub fn new(table: impl Into<String>, columns: Columns) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// An empty diff means no migration is needed
    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }
}
