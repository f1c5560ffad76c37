//! Server-specific error types

use std::path::PathBuf;

use factsink_common::FactError;
use thiserror::Error;

/// Result type alias for sink operations
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Durable queue failures
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue is closed")]
    Closed,

    #[error("Corrupt queue segment {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Queue item of {0} bytes does not fit in a segment frame")]
    TooLarge(usize),

    #[error("Queue state lock poisoned")]
    Poisoned,

    #[error("Queue I/O task failed: {0}")]
    Task(String),
}

/// Failures while turning a fact into a candidate table
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Column '{column}' of table '{table}' is produced by more than one field")]
    ColumnCollision { table: String, column: String },

    #[error("Cannot resolve table name: {0}")]
    TableName(String),
}

/// Failures reported by a destination adapter
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cannot store value {value} in column '{column}' of type {expected}")]
    Conversion {
        column: String,
        expected: &'static str,
        value: String,
    },

    #[error("Table '{0}' has no columns matching the fact")]
    NothingToInsert(String),

    #[error("Destination error: {0}")]
    Destination(String),
}

/// Errors surfaced by a sink's lifecycle operations
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Fact error: {0}")]
    Fact(#[from] FactError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Error closing {resource}: {source}")]
    Close {
        resource: &'static str,
        #[source]
        source: Box<SinkError>,
    },

    #[error("{}", join_errors(.0))]
    Combined(Vec<SinkError>),
}

impl SinkError {
    pub(crate) fn closing(resource: &'static str, source: impl Into<SinkError>) -> Self {
        SinkError::Close {
            resource,
            source: Box::new(source.into()),
        }
    }

    /// Fold collected failures into one error, or `Ok` when there are none
    pub(crate) fn combine(mut errors: Vec<SinkError>) -> SinkResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SinkError::Combined(errors)),
        }
    }
}

fn join_errors(errors: &[SinkError]) -> String {
    let parts: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("{} errors occurred: {}", errors.len(), parts.join("; "))
}
