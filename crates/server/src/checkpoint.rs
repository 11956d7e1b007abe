//! Periodic snapshot of the in-memory store to a JSON file.
//!
//! The file holds one object mapping metric id to its typed value, e.g.
//! `{"Alloc":{"type":"gauge","value":1.5},"PollCount":{"type":"counter","delta":3}}`,
//! followed by a newline. It is replaced atomically on every flush.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use metrics_types::MetricKind;
use metrics_types::MetricValue;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::error::CheckpointError;
use crate::storage::MetricStorage;
use crate::storage::Record;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    #[serde(rename = "type")]
    kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<f64>,
}

impl From<MetricValue> for Entry {
    fn from(value: MetricValue) -> Self {
        match value {
            MetricValue::Gauge(v) => Entry {
                kind: MetricKind::Gauge,
                delta: None,
                value: Some(v),
            },
            MetricValue::Counter(d) => Entry {
                kind: MetricKind::Counter,
                delta: Some(d),
                value: None,
            },
        }
    }
}

impl Entry {
    fn into_value(self) -> Option<MetricValue> {
        match (self.kind, self.delta, self.value) {
            (MetricKind::Gauge, _, Some(v)) => Some(MetricValue::Gauge(v)),
            (MetricKind::Counter, Some(d), _) => Some(MetricValue::Counter(d)),
            _ => None,
        }
    }
}

/// Serialises `records` into the checkpoint format.
pub fn encode(records: &[Record]) -> Result<Vec<u8>, Report<CheckpointError>> {
    let entries: BTreeMap<&str, Entry> = records
        .iter()
        .map(|r| (r.id.as_str(), Entry::from(r.value)))
        .collect();
    let mut bytes = serde_json::to_vec(&entries).change_context(CheckpointError::Encode)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parses a checkpoint. Blank input is an empty record set.
pub fn decode(bytes: &[u8], path: &Path) -> Result<Vec<Record>, Report<CheckpointError>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let malformed = |message: String| CheckpointError::Malformed {
        path: path.display().to_string(),
        message,
    };
    let entries: BTreeMap<String, Entry> =
        serde_json::from_slice(bytes).change_context_lazy(|| malformed("invalid JSON".into()))?;
    entries
        .into_iter()
        .map(|(id, entry)| {
            let kind = entry.kind;
            entry
                .into_value()
                .map(|value| Record::new(id.clone(), value))
                .ok_or_else(|| Report::new(malformed(format!("{kind} {id} has no payload"))))
        })
        .collect()
}

/// Owner of the checkpoint file.
#[derive(Debug)]
pub struct Checkpoint {
    path: PathBuf,
    // one flush at a time, they share the temp file
    write_lock: Mutex<()>,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, message: &str) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Writes the full record set of `storage`, replacing the previous file.
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::Store`] if the records cannot be read
    /// - [`CheckpointError::Io`] if the file cannot be written or renamed
    pub async fn flush(&self, storage: &dyn MetricStorage) -> Result<usize, Report<CheckpointError>> {
        // snapshot under the lock so files are written in snapshot order
        let _guard = self.write_lock.lock().await;
        let records = storage.get_all().await.change_context(CheckpointError::Store)?;
        let bytes = encode(&records)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .change_context_lazy(|| self.io_error("cannot create directory"))?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .change_context_lazy(|| self.io_error("cannot write temp file"))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .change_context_lazy(|| self.io_error("cannot replace checkpoint"))?;

        debug!(path = %self.path.display(), metrics = records.len(), "checkpoint written");
        Ok(records.len())
    }

    /// Reads the record set saved by the last flush. A missing file is an empty set.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::Io`] if the file exists but cannot be read
    /// - [`CheckpointError::Malformed`] if it cannot be parsed
    pub async fn restore(&self) -> Result<Vec<Record>, Report<CheckpointError>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no checkpoint found, starting empty");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(Report::new(err).change_context(self.io_error("cannot read checkpoint")));
            }
        };
        let records = decode(&bytes, &self.path)?;
        info!(path = %self.path.display(), metrics = records.len(), "checkpoint restored");
        Ok(records)
    }
}

/// Flushes `storage` every `interval` until `token` is cancelled, then once more.
pub fn spawn_flush_task(
    checkpoint: Arc<Checkpoint>,
    storage: Arc<dyn MetricStorage>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(path = %checkpoint.path().display(), ?interval, "checkpoint task started");
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = checkpoint.flush(storage.as_ref()).await {
                error!("periodic checkpoint failed: {err:?}");
            }
        }
        match checkpoint.flush(storage.as_ref()).await {
            Ok(written) => info!(metrics = written, "final checkpoint written"),
            Err(err) => error!("final checkpoint failed: {err:?}"),
        }
    })
}
