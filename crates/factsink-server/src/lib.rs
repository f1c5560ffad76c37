//! Factsink Server Library
//!
//! Durable delivery of schemaless JSON facts into relational destinations.
//!
//! # Overview
//!
//! Facts handed to a sink are never written to the destination directly:
//!
//! - **Durable queue**: every accepted fact is first appended to an on-disk
//!   segment queue, so a crash or an unreachable database loses nothing
//! - **Delivery worker**: one background task per sink drains the queue,
//!   infers a table shape for each fact and writes it
//! - **Schema evolution**: destination tables are created on first use and
//!   only ever grow new columns as new fields appear
//! - **Log sink**: an optional second consumer that appends every fact to a
//!   newline-delimited JSON file
//!
//! # Architecture
//!
//! ```text
//!  accept(fact) --> DurableQueue --> DeliveryWorker --> SinkAdapter --> PostgreSQL
//!                                         |
//!                                 ShapeInference + SchemaCache
//! ```
//!
//! Failures between dequeue and insert put the fact back at the tail of the
//! queue, so delivery is at-least-once and retries are unbounded.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use factsink_server::{
//!     adapter::PostgresAdapter,
//!     config::Config,
//!     flatten::{JsonFlattener, ShapeInference},
//!     queue::DurableQueue,
//!     sink::{Consumer, DurableSink},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let shutdown = CancellationToken::new();
//!
//!     let adapter = Arc::new(PostgresAdapter::connect(&config.database).await?);
//!     let inference: Arc<dyn ShapeInference> = Arc::new(JsonFlattener::fixed("events"));
//!     let queue = DurableQueue::open(
//!         config.queue.dir_for(&config.server_name, "postgres"),
//!         config.queue.options(),
//!     )?;
//!
//!     let sink = DurableSink::open("postgres", adapter, inference, queue, &shutdown).await?;
//!     sink.accept(factsink_common::Fact::from_json_str(r#"{"user_id":"u1"}"#)?).await;
//!     sink.close().await?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod adapter;
pub mod config;
pub mod error;
pub mod flatten;
pub mod queue;
pub mod schema;
pub mod sink;

// Re-export commonly used types
pub use error::{AdapterError, QueueError, SchemaError, SinkError, SinkResult};
