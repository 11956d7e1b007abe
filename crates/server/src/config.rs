use std::path::PathBuf;
use std::time::Duration;

use clap::ArgAction;
use clap::Parser;
use utils::backoff::BackoffSchedule;
use utils::version;

#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct ServerArgs {
    #[arg(
        short = 'a',
        long,
        env = "ADDRESS",
        default_value = "localhost:8080",
        help = "Listen address, host:port"
    )]
    pub address: String,

    #[arg(
        short = 'i',
        long,
        env = "STORE_INTERVAL",
        default_value_t = 300,
        help = "Seconds between two checkpoint flushes, 0 flushes after every write"
    )]
    pub store_interval: u64,

    #[arg(
        short = 'f',
        long,
        env = "FILE_STORAGE_PATH",
        default_value = "/tmp/metrics-db.json",
        help = "Checkpoint file of the in-memory store"
    )]
    pub file_storage_path: PathBuf,

    #[arg(
        short = 'r',
        long,
        env = "RESTORE",
        default_value_t = true,
        action = ArgAction::Set,
        help = "Load the checkpoint file before serving"
    )]
    pub restore: bool,

    #[arg(
        short = 'd',
        long,
        env = "DATABASE_DSN",
        help = "SQLite database path; selects the durable backend when set"
    )]
    pub database_dsn: Option<String>,

    #[arg(
        short = 'k',
        long,
        env = "KEY",
        help = "Shared secret used to verify request bodies (HashSHA256 header)"
    )]
    pub key: Option<String>,
}

/// Where metrics live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// In-process map, optionally checkpointed to a file.
    Memory,
    /// SQLite database at the given path or URI.
    Sql { dsn: String },
}

/// When the in-memory store is written to the checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// On a fixed timer.
    Periodic(Duration),
    /// After every successful write request.
    Synchronous,
}

/// Server configuration, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub backend: StorageBackend,
    pub flush: FlushPolicy,
    pub checkpoint_path: PathBuf,
    pub restore: bool,
    pub key: Option<String>,
    /// retry schedule for connection-class storage errors
    pub backoff: BackoffSchedule,
}

impl ServerConfig {
    /// In-memory server without checkpoint restore, listening on `address`.
    pub fn new(address: impl Into<String>, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            backend: StorageBackend::Memory,
            flush: FlushPolicy::Periodic(Duration::from_secs(300)),
            checkpoint_path: checkpoint_path.into(),
            restore: false,
            key: None,
            backoff: BackoffSchedule::default(),
        }
    }

    pub fn with_backend(mut self, backend: StorageBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_flush(mut self, flush: FlushPolicy) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_restore(mut self, restore: bool) -> Self {
        self.restore = restore;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.backoff = backoff;
        self
    }

    /// Checkpointing only applies to the in-memory backend.
    pub fn checkpoint_enabled(&self) -> bool {
        self.backend == StorageBackend::Memory
    }
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        let backend = match args.database_dsn.filter(|dsn| !dsn.trim().is_empty()) {
            Some(dsn) => StorageBackend::Sql { dsn },
            None => StorageBackend::Memory,
        };
        let flush = match args.store_interval {
            0 => FlushPolicy::Synchronous,
            secs => FlushPolicy::Periodic(Duration::from_secs(secs)),
        };
        Self {
            key: args.key.filter(|k| !k.is_empty()),
            ..ServerConfig::new(args.address, args.file_storage_path)
                .with_backend(backend)
                .with_flush(flush)
                .with_restore(args.restore)
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults_select_memory_backend_with_restore() {
        let config = ServerConfig::from(ServerArgs::try_parse_from(["server"]).expect("parse"));

        assert_eq!(config.address, "localhost:8080");
        assert_eq!(config.backend, StorageBackend::Memory);
        assert_eq!(config.flush, FlushPolicy::Periodic(Duration::from_secs(300)));
        assert_eq!(config.checkpoint_path, PathBuf::from("/tmp/metrics-db.json"));
        assert!(config.restore);
        assert!(config.key.is_none());
        assert!(config.checkpoint_enabled());
    }

    #[test]
    fn zero_store_interval_flushes_synchronously() {
        let args = ServerArgs::try_parse_from(["server", "-i", "0", "-r", "false"]).expect("parse");
        let config = ServerConfig::from(args);

        assert_eq!(config.flush, FlushPolicy::Synchronous);
        assert!(!config.restore);
    }

    #[test]
    fn dsn_selects_sql_backend() {
        let args = ServerArgs::try_parse_from(["server", "-d", "/var/lib/metrics.db", "-k", "k"])
            .expect("parse");
        let config = ServerConfig::from(args);

        assert_eq!(
            config.backend,
            StorageBackend::Sql {
                dsn: "/var/lib/metrics.db".to_string()
            }
        );
        assert_eq!(config.key.as_deref(), Some("k"));
        assert!(!config.checkpoint_enabled());
    }
}
