//! Destination adapter interface
//!
//! Each destination technology implements [`SinkAdapter`]. Every method is
//! one round trip to the destination, and all technology-specific DDL and
//! value encoding stays behind this trait.

pub mod postgres;

use async_trait::async_trait;
use factsink_common::Fact;

use crate::error::AdapterError;
use crate::schema::{SchemaDiff, Table};

pub use postgres::PostgresAdapter;

/// Schema-aware writer for one destination
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    /// Current shape of `table`; the result does not exist when the table is absent
    async fn get_schema(&self, table: &str) -> Result<Table, AdapterError>;

    /// Create the namespace tables live in (e.g. a database schema)
    async fn create_destination(&self) -> Result<(), AdapterError>;

    async fn create_table(&self, table: &Table) -> Result<(), AdapterError>;

    /// Add the diff's columns to an existing table
    async fn patch_table(&self, diff: &SchemaDiff) -> Result<(), AdapterError>;

    /// Store one flattened fact in `table`
    async fn insert(&self, table: &Table, fact: &Fact) -> Result<(), AdapterError>;

    async fn close(&self) -> Result<(), AdapterError>;
}
