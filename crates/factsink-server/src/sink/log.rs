//! Best-effort JSON lines sink
//!
//! Facts go through a bounded channel to one writer task, which appends each
//! as a single line. `accept` waits while the channel is full. Nothing here
//! is retried: a fact that cannot be serialized or written is logged and
//! dropped.

use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use factsink_common::Fact;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::Consumer;
use crate::error::{SinkError, SinkResult};

/// Facts buffered in memory before `accept` starts waiting
pub const DEFAULT_LOG_SINK_CAPACITY: usize = 20_000;

/// Appends every accepted fact to a writer as one JSON line
pub struct LogSink {
    sender: RwLock<Option<mpsc::Sender<Fact>>>,
    writer: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

impl LogSink {
    /// Start a writer task over `writer` buffering up to `capacity` facts
    pub fn new<W>(writer: W, capacity: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(write_lines(receiver, writer));

        Self {
            sender: RwLock::new(Some(sender)),
            writer: Mutex::new(Some(handle)),
        }
    }

    /// Append to the file at `path`, creating it and its parent directory
    pub async fn open(path: impl AsRef<Path>, capacity: usize) -> SinkResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        info!(path = %path.display(), capacity, "Log sink opened");
        Ok(Self::new(file, capacity))
    }
}

#[async_trait]
impl Consumer for LogSink {
    async fn accept(&self, fact: Fact) {
        let sender = self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(sender) = sender else {
            warn!("Log sink is closed, dropping fact");
            return;
        };

        if sender.send(fact).await.is_err() {
            error!("Log writer has stopped, dropping fact");
        }
    }

    /// Stop intake, write out everything buffered and close the writer
    async fn close(&self) -> SinkResult<()> {
        drop(self.sender.write().unwrap_or_else(PoisonError::into_inner).take());

        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(handle) = writer else {
            return Ok(());
        };

        match handle.await {
            Ok(Ok(())) => {
                info!("Log sink closed");
                Ok(())
            },
            Ok(Err(e)) => Err(SinkError::closing("log writer", e)),
            Err(e) => Err(SinkError::Task(e.to_string())),
        }
    }
}

async fn write_lines<W>(mut receiver: mpsc::Receiver<Fact>, writer: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    while let Some(fact) = receiver.recv().await {
        let mut line = match fact.to_vec() {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Dropping fact that cannot be serialized");
                continue;
            },
        };
        line.push(b'\n');

        if let Err(e) = writer.write_all(&line).await {
            error!(error = %e, "Failed to write fact to log");
            continue;
        }

        if receiver.is_empty() {
            if let Err(e) = writer.flush().await {
                error!(error = %e, "Failed to flush fact log");
            }
        }
    }

    writer.flush().await?;
    writer.shutdown().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn fact(i: usize) -> Fact {
        Fact::try_from(json!({"seq": i, "padding": "x".repeat(1000)})).unwrap()
    }

    #[tokio::test]
    async fn test_writes_one_line_per_fact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("facts.ndjson");

        let sink = LogSink::open(&path, 8).await.unwrap();
        for i in 0..3 {
            sink.accept(Fact::try_from(json!({"seq": i, "ok": true})).unwrap()).await;
        }
        sink.close().await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, [
            r#"{"seq":0,"ok":true}"#,
            r#"{"seq":1,"ok":true}"#,
            r#"{"seq":2,"ok":true}"#,
        ]);
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.ndjson");

        for i in 0..2 {
            let sink = LogSink::open(&path, 8).await.unwrap();
            sink.accept(Fact::try_from(json!({"run": i})).unwrap()).await;
            sink.close().await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_accept_after_close_is_dropped() {
        let (writer, mut reader) = tokio::io::duplex(4096);
        let sink = LogSink::new(writer, 4);

        sink.accept(Fact::try_from(json!({"n": 1})).unwrap()).await;
        sink.close().await.unwrap();
        sink.accept(Fact::try_from(json!({"n": 2})).unwrap()).await;
        assert!(sink.close().await.is_ok());

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"n\":1}\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_buffer_suspends_accept() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let sink = LogSink::new(writer, 1);

        // Nobody reads yet, so the writer stalls and the buffer fills up
        let mut accepted = 0;
        let mut blocked = false;
        for i in 0..32 {
            if tokio::time::timeout(Duration::from_millis(200), sink.accept(fact(i)))
                .await
                .is_err()
            {
                blocked = true;
                break;
            }
            accepted += 1;
        }
        assert!(blocked, "accept should wait once the buffer is full");

        let drain = tokio::spawn(async move {
            let mut out = String::new();
            reader.read_to_string(&mut out).await.map(|_| out)
        });

        tokio::time::timeout(Duration::from_secs(5), sink.accept(fact(999)))
            .await
            .expect("accept should resume once the writer drains");
        sink.close().await.unwrap();

        let out = drain.await.unwrap().unwrap();
        assert_eq!(out.lines().count(), accepted + 1);
        assert!(out.lines().last().unwrap().starts_with(r#"{"seq":999"#));
    }
}
