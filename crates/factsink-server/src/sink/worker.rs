//! Background delivery loop of a durable sink
//!
//! One pass: fetch the next queued fact, decode it, infer its shape, bring
//! the destination table up to that shape and insert. Anything that fails
//! after decoding puts the original fact back at the tail of the queue.

use std::sync::Arc;

use factsink_common::Fact;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::SinkAdapter;
use crate::error::{QueueError, SinkResult};
use crate::flatten::ShapeInference;
use crate::queue::{DurableQueue, QueuedFact};
use crate::schema::{SchemaCache, Table};

/// What happened to one dequeued item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Outcome {
    Delivered,
    Dropped,
    Requeued,
}

pub(super) struct DeliveryWorker<A> {
    pub(super) sink: String,
    pub(super) adapter: Arc<A>,
    pub(super) inference: Arc<dyn ShapeInference>,
    pub(super) queue: Arc<DurableQueue>,
    pub(super) cache: Arc<SchemaCache>,
    pub(super) shutdown: CancellationToken,
}

impl<A: SinkAdapter> DeliveryWorker<A> {
    pub(super) async fn run(self) {
        info!(sink = %self.sink, "Delivery worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Only the wait races shutdown; a started removal always completes
            let ready = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                ready = self.queue.wait_ready() => ready,
            };
            let item = match ready {
                Ok(()) => self.queue.try_dequeue_async().await,
                Err(e) => Err(e),
            };

            match item {
                Ok(None) => {},
                Ok(Some(item)) => {
                    if self.deliver(item).await == Outcome::Requeued {
                        // Let producers and the shutdown path in between retries
                        tokio::task::yield_now().await;
                    }
                },
                Err(QueueError::Closed) => {
                    debug!(sink = %self.sink, "Queue closed");
                    break;
                },
                Err(QueueError::Poisoned) => {
                    error!(sink = %self.sink, "Queue state is poisoned, stopping delivery");
                    break;
                },
                Err(e) => {
                    error!(sink = %self.sink, error = %e, "Error reading fact from queue");
                },
            }
        }

        info!(sink = %self.sink, pending = self.queue.len(), "Delivery worker stopped");
    }

    pub(super) async fn deliver(&self, item: QueuedFact) -> Outcome {
        if item.is_empty() {
            warn!(sink = %self.sink, "Dropping empty queued fact");
            return Outcome::Dropped;
        }

        let fact = match item.into_fact() {
            Ok(fact) => fact,
            Err(e) => {
                error!(sink = %self.sink, error = %e, "Dropping queued fact that cannot be decoded");
                return Outcome::Dropped;
            },
        };

        match self.store(&fact).await {
            Ok(true) => Outcome::Delivered,
            Ok(false) => Outcome::Dropped,
            Err(e) => {
                warn!(sink = %self.sink, error = %e, "Failed to store fact, requeueing");
                enqueue_fact(&self.sink, &self.queue, &fact).await;
                Outcome::Requeued
            },
        }
    }

    /// Returns `false` when the fact has no shape to store
    async fn store(&self, fact: &Fact) -> SinkResult<bool> {
        let (candidate, row) = self.inference.infer(fact)?;
        if !candidate.exists() {
            debug!(sink = %self.sink, "Fact has no columns, skipping");
            return Ok(false);
        }

        let table = self.resolve(&candidate).await?;

        let diff = table.diff(&candidate);
        let table = if diff.exists() {
            self.adapter.patch_table(&diff).await?;
            info!(
                sink = %self.sink,
                table = %diff.table(),
                columns = diff.columns().len(),
                "Patched table"
            );
            match self.cache.merge_diff(&diff) {
                Some(merged) => merged,
                None => {
                    let mut merged = table;
                    merged.merge(&diff);
                    merged
                },
            }
        } else {
            table
        };

        self.adapter.insert(&table, &row).await?;
        Ok(true)
    }

    /// Cached shape of the candidate's table, fetching or creating it on a miss
    async fn resolve(&self, candidate: &Table) -> SinkResult<Table> {
        if let Some(table) = self.cache.get(candidate.name()) {
            return Ok(table);
        }

        let mut table = self.adapter.get_schema(candidate.name()).await?;
        if !table.exists() {
            self.adapter.create_table(candidate).await?;
            info!(sink = %self.sink, table = %candidate.name(), "Created table");
            table = candidate.clone();
        }

        self.cache.insert(table.clone());
        Ok(table)
    }
}

/// Serialize and append a fact; failures are logged and the fact dropped
pub(super) async fn enqueue_fact(sink: &str, queue: &Arc<DurableQueue>, fact: &Fact) {
    let item = match QueuedFact::from_fact(fact) {
        Ok(item) => item,
        Err(e) => {
            error!(sink = %sink, error = %e, "Dropping fact that cannot be serialized");
            return;
        },
    };

    if let Err(e) = queue.enqueue_async(item).await {
        error!(sink = %sink, error = %e, "Dropping fact, enqueue failed");
    }
}
