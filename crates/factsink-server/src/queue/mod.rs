//! Crash-safe, disk-backed FIFO of serialized facts
//!
//! The queue lives in one directory as a run of numbered segment files (see
//! [`segment`]). Only the head segment (being drained) and the tail segment
//! (being appended to) are held in memory; segments in between are replayed
//! from disk when the head reaches them.
//!
//! Many producers may call [`DurableQueue::enqueue`] concurrently. A single
//! consumer drains it with [`DurableQueue::dequeue_blocking`], which waits
//! until an item arrives or the queue is closed. The `_async` variants run
//! on the blocking pool when every write is fsynced.

mod segment;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use factsink_common::{Fact, FactError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use segment::Segment;

/// Items written to one segment before the queue rotates to a new file
pub const DEFAULT_ITEMS_PER_SEGMENT: usize = 2000;

/// Durable representation of a fact: its serialized bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedFact {
    bytes: Vec<u8>,
}

impl QueuedFact {
    pub fn from_fact(fact: &Fact) -> Result<Self, FactError> {
        Ok(Self {
            bytes: fact.to_vec()?,
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Rebuild the fact; empty or malformed payloads can never succeed
    pub fn into_fact(self) -> Result<Fact, FactError> {
        Fact::from_slice(&self.bytes)
    }
}

/// Storage options for a [`DurableQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub items_per_segment: usize,
    /// fsync after every frame
    pub sync_writes: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            items_per_segment: DEFAULT_ITEMS_PER_SEGMENT,
            sync_writes: false,
        }
    }
}

struct QueueState {
    dir: PathBuf,
    options: QueueOptions,
    head: Segment,
    /// Sealed segments between head and tail, oldest first
    middle: VecDeque<u64>,
    tail: Option<Segment>,
    pending: usize,
    closed: bool,
}

impl QueueState {
    fn push(&mut self, payload: Vec<u8>) -> Result<(), QueueError> {
        self.rotate_if_full()?;
        match self.tail.as_mut() {
            Some(tail) => tail.push(payload)?,
            None => self.head.push(payload)?,
        }
        self.pending += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Option<Vec<u8>>, QueueError> {
        self.settle_head()?;
        let item = self.head.pop()?;
        if item.is_some() {
            self.pending -= 1;
            // The item is already consumed; a failed cleanup is retried on the next pop
            if let Err(e) = self.settle_head() {
                warn!(queue = %self.dir.display(), error = %e, "Failed to advance queue head segment");
            }
        }
        Ok(item)
    }

    fn rotate_if_full(&mut self) -> Result<(), QueueError> {
        let per_segment = self.options.items_per_segment;
        let last = self.tail.as_ref().unwrap_or(&self.head);
        if !last.is_full(per_segment) {
            return Ok(());
        }

        let number = last.number() + 1;
        let fresh = Segment::create(&self.dir, number, self.options.sync_writes)?;
        debug!(queue = %self.dir.display(), segment = number, "Rotated to new queue segment");

        match self.tail.replace(fresh) {
            Some(mut previous) => {
                previous.seal();
                previous.sync()?;
                self.middle.push_back(previous.number());
            },
            None => self.head.seal(),
        }
        Ok(())
    }

    /// Delete drained head segments and move on to the next one
    fn settle_head(&mut self) -> Result<(), QueueError> {
        let per_segment = self.options.items_per_segment;
        while self.head.is_exhausted(per_segment) {
            // A failed load leaves the segment queued so a later pop retries it
            let next = match self.middle.front().copied() {
                Some(number) => {
                    let mut segment = Segment::load(&self.dir, number, self.options.sync_writes)?;
                    segment.seal();
                    self.middle.pop_front();
                    segment
                },
                None => match self.tail.take() {
                    Some(tail) => tail,
                    None => Segment::create(
                        &self.dir,
                        self.head.number() + 1,
                        self.options.sync_writes,
                    )?,
                },
            };
            let drained = std::mem::replace(&mut self.head, next);
            let number = drained.number();
            drained.remove()?;
            debug!(queue = %self.dir.display(), segment = number, "Removed drained queue segment");
        }
        Ok(())
    }

    /// Flush segment contents and the directory entries naming them
    fn sync(&self) -> std::io::Result<()> {
        self.head.sync()?;
        if let Some(tail) = &self.tail {
            tail.sync()?;
        }
        std::fs::File::open(&self.dir)?.sync_all()
    }
}

/// Append-only FIFO persisted as segment files in one directory
pub struct DurableQueue {
    dir: PathBuf,
    /// Async callers run queue I/O on the blocking pool
    offload: bool,
    state: Mutex<QueueState>,
    available: Notify,
}

impl DurableQueue {
    /// Open the queue in `dir`, creating it when absent
    ///
    /// Existing segments are replayed so that dequeuing resumes with the
    /// oldest item that was not yet removed.
    pub fn open(dir: impl Into<PathBuf>, options: QueueOptions) -> Result<Self, QueueError> {
        let dir = dir.into();
        let options = QueueOptions {
            items_per_segment: options.items_per_segment.max(1),
            ..options
        };
        std::fs::create_dir_all(&dir)?;

        let mut numbers = list_segments(&dir)?;
        let sync = options.sync_writes;

        let (head, middle, tail, pending) = match numbers.len() {
            0 => (Segment::create(&dir, 1, sync)?, VecDeque::new(), None, 0),
            1 => {
                let head = Segment::load(&dir, numbers[0], sync)?;
                let pending = head.pending();
                (head, VecDeque::new(), None, pending)
            },
            _ => {
                let last = numbers.pop().unwrap_or_default();
                let mut head = Segment::load(&dir, numbers[0], sync)?;
                head.seal();
                let tail = Segment::load(&dir, last, sync)?;

                let mut pending = head.pending() + tail.pending();
                let middle: VecDeque<u64> = numbers.iter().skip(1).copied().collect();
                for &number in &middle {
                    pending += Segment::load(&dir, number, sync)?.pending();
                }
                (head, middle, Some(tail), pending)
            },
        };

        let mut state = QueueState {
            dir: dir.clone(),
            options,
            head,
            middle,
            tail,
            pending,
            closed: false,
        };
        state.settle_head()?;

        info!(
            queue = %dir.display(),
            pending = state.pending,
            items_per_segment = options.items_per_segment,
            "Opened durable queue"
        );

        Ok(Self {
            dir,
            offload: options.sync_writes,
            state: Mutex::new(state),
            available: Notify::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append an item at the tail
    pub fn enqueue(&self, item: QueuedFact) -> Result<(), QueueError> {
        {
            let mut state = self.lock()?;
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.push(item.bytes)?;
        }
        self.available.notify_waiters();
        Ok(())
    }

    /// Remove the head item if there is one
    pub fn try_dequeue(&self) -> Result<Option<QueuedFact>, QueueError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(QueueError::Closed);
        }
        Ok(state.pop()?.map(QueuedFact::from_bytes))
    }

    /// [`DurableQueue::enqueue`] for async callers
    ///
    /// With `sync_writes` the write and its fsync run on the blocking pool.
    pub async fn enqueue_async(self: &Arc<Self>, item: QueuedFact) -> Result<(), QueueError> {
        self.offload(move |queue| queue.enqueue(item)).await
    }

    /// [`DurableQueue::try_dequeue`] for async callers
    pub async fn try_dequeue_async(self: &Arc<Self>) -> Result<Option<QueuedFact>, QueueError> {
        self.offload(|queue| queue.try_dequeue()).await
    }

    /// Wait until an item is pending, without removing it
    ///
    /// Cancel-safe. Returns [`QueueError::Closed`] once the queue is closed,
    /// including to a caller that is already waiting.
    pub async fn wait_ready(&self) -> Result<(), QueueError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.lock()?;
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if state.pending > 0 {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Remove the head item, waiting until one is available
    ///
    /// With `sync_writes` the removal runs on the blocking pool and is not
    /// cancel-safe; race [`DurableQueue::wait_ready`] instead when the wait
    /// must be abandoned.
    pub async fn dequeue_blocking(self: &Arc<Self>) -> Result<QueuedFact, QueueError> {
        loop {
            self.wait_ready().await?;
            if let Some(item) = self.try_dequeue_async().await? {
                return Ok(item);
            }
        }
    }

    /// Items enqueued and not yet dequeued
    pub fn len(&self) -> usize {
        self.lock().map(|state| state.pending).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|state| state.closed).unwrap_or(true)
    }

    /// Flush segment files and the directory, then wake any waiting consumer
    ///
    /// Pending items stay on disk for the next [`DurableQueue::open`].
    pub fn close(&self) -> Result<(), QueueError> {
        let result = {
            let mut state = self.lock()?;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            info!(queue = %self.dir.display(), pending = state.pending, "Closing durable queue");
            state.sync()
        };
        self.available.notify_waiters();
        result.map_err(QueueError::from)
    }

    async fn offload<T, F>(self: &Arc<Self>, op: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&DurableQueue) -> Result<T, QueueError> + Send + 'static,
    {
        if !self.offload {
            return op(self.as_ref());
        }
        let queue = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(queue.as_ref()))
            .await
            .map_err(|e| QueueError::Task(e.to_string()))?
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }
}

fn list_segments(dir: &Path) -> Result<Vec<u64>, QueueError> {
    let mut numbers = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(number) = entry.file_name().to_str().and_then(Segment::parse_file_name) {
            numbers.push(number);
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}
