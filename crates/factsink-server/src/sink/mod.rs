//! Fact consumers
//!
//! A [`Consumer`] takes facts from intake and owns everything that happens to
//! them afterwards. [`DurableSink`] persists and delivers facts to a
//! destination with at-least-once semantics; [`LogSink`] appends them to a
//! JSON lines file on a best-effort basis.

mod durable;
mod log;
mod worker;

use async_trait::async_trait;
use factsink_common::Fact;

use crate::error::SinkResult;

pub use durable::DurableSink;
pub use log::{LogSink, DEFAULT_LOG_SINK_CAPACITY};

/// Destination-agnostic receiver of facts
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Hand over one fact; failures are logged, never returned
    async fn accept(&self, fact: Fact);

    /// Stop intake and release resources
    async fn close(&self) -> SinkResult<()>;
}
