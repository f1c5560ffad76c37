//! Factsink Server - Main entry point
//!
//! Reads newline-delimited JSON facts and hands each one to every configured
//! sink until the input ends or a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use factsink_common::logging::{init_logging, LogConfig};
use factsink_common::Fact;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use factsink_server::{
    adapter::PostgresAdapter,
    config::Config,
    flatten::{JsonFlattener, ShapeInference},
    queue::DurableQueue,
    sink::{Consumer, DurableSink, LogSink},
};

/// Name of the PostgreSQL sink; part of its queue directory
const POSTGRES_SINK: &str = "postgres";

#[derive(Parser, Debug)]
#[command(name = "factsink-server")]
#[command(about = "Durably deliver JSON facts to PostgreSQL", long_about = None)]
#[command(version)]
struct Args {
    /// Read facts from this file instead of stdin
    #[arg(short, long, env = "FACTSINK_INPUT")]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging with configuration from environment
    let log_config = LogConfig::builder()
        .log_file_prefix("factsink-server")
        .filter_directives("factsink_server=debug,sqlx=warn")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    info!("Starting Factsink Server");

    let config = Config::load()?;
    info!(
        server_name = %config.server_name,
        queue_dir = %config.queue.dir.display(),
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();

    let adapter = Arc::new(PostgresAdapter::connect(&config.database).await?);
    let inference: Arc<dyn ShapeInference> = Arc::new(JsonFlattener::new(config.table.source()));
    let queue = DurableQueue::open(
        config.queue.dir_for(&config.server_name, POSTGRES_SINK),
        config.queue.options(),
    )
    .context("Failed to open durable queue")?;

    let durable = DurableSink::open(POSTGRES_SINK, adapter, inference, queue, &shutdown)
        .await
        .context("Failed to open PostgreSQL sink")?;

    let mut sinks: Vec<Box<dyn Consumer>> = vec![Box::new(durable)];
    if let Some(path) = &config.log_sink.path {
        sinks.push(Box::new(LogSink::open(path, config.log_sink.capacity).await?));
    }

    let intake = async {
        match &args.input {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                read_facts(file, &sinks).await
            },
            None => read_facts(tokio::io::stdin(), &sinks).await,
        }
    };

    tokio::select! {
        result = intake => {
            let count = result?;
            info!(facts = count, "Input exhausted, starting graceful shutdown");
        },
        _ = shutdown_signal() => {},
    }

    shutdown.cancel();

    let timeout_secs = config.shutdown_timeout_secs;
    info!("Waiting up to {} seconds for sinks to close", timeout_secs);
    let closing = futures::future::join_all(sinks.iter().map(|sink| sink.close()));
    match tokio::time::timeout(Duration::from_secs(timeout_secs), closing).await {
        Ok(results) => {
            for e in results.into_iter().filter_map(|r| r.err()) {
                error!(error = %e, "Failed to close sink");
            }
        },
        Err(_) => warn!("Timed out closing sinks"),
    }

    info!("Server shut down gracefully");

    Ok(())
}

/// Feed every line of `input` to all sinks; returns the number of facts read
async fn read_facts<R>(input: R, sinks: &[Box<dyn Consumer>]) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut count = 0;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let fact = match Fact::from_json_str(&line) {
            Ok(fact) => fact,
            Err(e) => {
                warn!(error = %e, "Skipping input line that is not a JSON object");
                continue;
            },
        };

        for sink in sinks {
            sink.accept(fact.clone()).await;
        }
        count += 1;
    }

    Ok(count)
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
