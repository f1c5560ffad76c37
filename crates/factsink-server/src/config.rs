//! Configuration management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::flatten::TableNameSource;
use crate::queue::{QueueOptions, DEFAULT_ITEMS_PER_SEGMENT};
use crate::sink::DEFAULT_LOG_SINK_CAPACITY;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Server name used when the hostname cannot be determined.
pub const DEFAULT_SERVER_NAME: &str = "factsink";

/// Default root directory for durable queues.
pub const DEFAULT_QUEUE_DIR: &str = "./data/queue";

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/factsink";

/// Default database schema tables are created in.
pub const DEFAULT_DATABASE_SCHEMA: &str = "public";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default destination table.
pub const DEFAULT_TABLE_NAME: &str = "events";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Prefix of every queue directory; keeps queues of several servers apart
    pub server_name: String,
    pub queue: QueueConfig,
    pub database: DatabaseConfig,
    pub table: TableConfig,
    pub log_sink: LogSinkConfig,
    pub shutdown_timeout_secs: u64,
}

/// Durable queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub dir: PathBuf,
    pub items_per_segment: usize,
    pub sync_writes: bool,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub schema: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Destination table naming
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    /// Fact field holding the table name; `name` is the fallback
    pub name_field: Option<String>,
}

/// Log sink configuration; disabled when `path` is unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSinkConfig {
    pub path: Option<PathBuf>,
    pub capacity: usize,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            server_name: std::env::var("FACTSINK_SERVER_NAME").unwrap_or_else(|_| default_server_name()),
            queue: QueueConfig {
                dir: std::env::var("FACTSINK_QUEUE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(DEFAULT_QUEUE_DIR)),
                items_per_segment: env_parse("FACTSINK_QUEUE_ITEMS_PER_SEGMENT")
                    .unwrap_or(DEFAULT_ITEMS_PER_SEGMENT),
                sync_writes: env_parse("FACTSINK_QUEUE_SYNC_WRITES").unwrap_or(false),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                schema: std::env::var("DATABASE_SCHEMA")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_SCHEMA.to_string()),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS")
                    .unwrap_or(DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT")
                    .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
            },
            table: TableConfig {
                name: std::env::var("FACTSINK_TABLE_NAME")
                    .unwrap_or_else(|_| DEFAULT_TABLE_NAME.to_string()),
                name_field: std::env::var("FACTSINK_TABLE_NAME_FIELD")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
            },
            log_sink: LogSinkConfig {
                path: std::env::var("FACTSINK_LOG_SINK_PATH")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from),
                capacity: env_parse("FACTSINK_LOG_SINK_CAPACITY")
                    .unwrap_or(DEFAULT_LOG_SINK_CAPACITY),
            },
            shutdown_timeout_secs: env_parse("FACTSINK_SHUTDOWN_TIMEOUT")
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_name.trim().is_empty() {
            anyhow::bail!("Server name cannot be empty");
        }

        // The server name becomes part of a directory name
        if self.server_name.contains(['/', '\\']) {
            anyhow::bail!("Server name '{}' must not contain path separators", self.server_name);
        }

        if self.queue.items_per_segment == 0 {
            anyhow::bail!("Queue items_per_segment must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.schema.trim().is_empty() {
            anyhow::bail!("Database schema cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.table.name.trim().is_empty() {
            anyhow::bail!("Table name cannot be empty");
        }

        if self.log_sink.capacity == 0 {
            anyhow::bail!("Log sink capacity must be greater than 0");
        }

        if self.queue.sync_writes {
            tracing::info!("Queue writes are synced to disk after every frame");
        }

        Ok(())
    }
}

impl QueueConfig {
    pub fn options(&self) -> QueueOptions {
        QueueOptions {
            items_per_segment: self.items_per_segment,
            sync_writes: self.sync_writes,
        }
    }

    /// Directory of one sink's queue: `<dir>/<server_name>-<sink>`
    pub fn dir_for(&self, server_name: &str, sink: &str) -> PathBuf {
        self.dir.join(format!("{}-{}", server_name, sink))
    }
}

impl TableConfig {
    pub fn source(&self) -> TableNameSource {
        match &self.name_field {
            Some(field) => TableNameSource::Field {
                field: field.clone(),
                fallback: self.name.clone(),
            },
            None => TableNameSource::Fixed(self.name.clone()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            queue: QueueConfig {
                dir: PathBuf::from(DEFAULT_QUEUE_DIR),
                items_per_segment: DEFAULT_ITEMS_PER_SEGMENT,
                sync_writes: false,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                schema: DEFAULT_DATABASE_SCHEMA.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            table: TableConfig {
                name: DEFAULT_TABLE_NAME.to_string(),
                name_field: None,
            },
            log_sink: LogSinkConfig {
                path: None,
                capacity: DEFAULT_LOG_SINK_CAPACITY,
            },
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn default_server_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string())
}
