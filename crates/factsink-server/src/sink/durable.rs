//! Queue-backed sink with at-least-once delivery

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use factsink_common::Fact;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::worker::{enqueue_fact, DeliveryWorker};
use super::Consumer;
use crate::adapter::SinkAdapter;
use crate::error::{SinkError, SinkResult};
use crate::flatten::ShapeInference;
use crate::queue::DurableQueue;
use crate::schema::{SchemaCache, Table};

/// Persists every accepted fact before delivering it to a [`SinkAdapter`]
///
/// `accept` only appends to the queue. A background worker drains it,
/// evolves destination tables as new fields appear and retries failed
/// facts indefinitely.
pub struct DurableSink<A: SinkAdapter> {
    name: String,
    adapter: Arc<A>,
    queue: Arc<DurableQueue>,
    cache: Arc<SchemaCache>,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<A: SinkAdapter + 'static> DurableSink<A> {
    /// Prepare the destination and start delivering from `queue`
    ///
    /// The worker stops when `shutdown` is cancelled or the sink is closed.
    #[instrument(skip_all, fields(sink = %name.as_ref()))]
    pub async fn open(
        name: impl AsRef<str>,
        adapter: Arc<A>,
        inference: Arc<dyn ShapeInference>,
        queue: DurableQueue,
        shutdown: &CancellationToken,
    ) -> SinkResult<Self> {
        let name = name.as_ref().to_string();
        adapter.create_destination().await?;

        let queue = Arc::new(queue);
        let cache = Arc::new(SchemaCache::new());
        let stop = shutdown.child_token();

        let worker = DeliveryWorker {
            sink: name.clone(),
            adapter: Arc::clone(&adapter),
            inference,
            queue: Arc::clone(&queue),
            cache: Arc::clone(&cache),
            shutdown: stop.clone(),
        };
        let handle = tokio::spawn(worker.run());

        info!(queue = %queue.dir().display(), pending = queue.len(), "Durable sink opened");

        Ok(Self {
            name,
            adapter,
            queue,
            cache,
            stop,
            worker: Mutex::new(Some(handle)),
        })
    }
}

impl<A: SinkAdapter> DurableSink<A> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Facts waiting in the queue
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Cached shape of `table`, if the worker has resolved it
    pub fn cached_table(&self, table: &str) -> Option<Table> {
        self.cache.get(table)
    }

    /// Forget the cached shape of `table` so the next fact refetches it
    ///
    /// Use after the destination table was changed out of band.
    pub fn invalidate_schema(&self, table: &str) -> bool {
        let dropped = self.cache.invalidate(table);
        if dropped {
            info!(sink = %self.name, table = %table, "Invalidated cached schema");
        }
        dropped
    }
}

#[async_trait]
impl<A: SinkAdapter + 'static> Consumer for DurableSink<A> {
    async fn accept(&self, fact: Fact) {
        enqueue_fact(&self.name, &self.queue, &fact).await;
    }

    /// Stop the worker, then close the destination and the queue
    ///
    /// Both closes are attempted; their failures are reported together.
    async fn close(&self) -> SinkResult<()> {
        self.stop.cancel();

        let mut errors = Vec::new();

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                errors.push(SinkError::Task(e.to_string()));
            }
        }

        if let Err(e) = self.adapter.close().await {
            errors.push(SinkError::closing("destination", e));
        }
        if let Err(e) = self.queue.close() {
            errors.push(SinkError::closing("queue", e));
        }

        info!(sink = %self.name, pending = self.queue.len(), "Durable sink closed");
        SinkError::combine(errors)
    }
}
