//! SQLite-backed durable store.
//!
//! All statements run on the blocking pool against one connection guarded by a
//! mutex. Every write runs in an immediate transaction, which also serialises
//! writers coming from other processes sharing the database file.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use metrics_types::MetricKind;
use metrics_types::MetricValue;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OptionalExtension;
use rusqlite::Transaction;
use rusqlite::TransactionBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use utils::backoff;
use utils::backoff::BackoffSchedule;

use super::merge;
use super::MetricStorage;
use super::Record;
use crate::error::StorageError;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS metrics (
    name  TEXT PRIMARY KEY,
    type  TEXT NOT NULL,
    delta INTEGER,
    value REAL
)";

pub struct SqlStorage {
    conn: Arc<Mutex<Connection>>,
    dsn: String,
    backoff: BackoffSchedule,
}

impl SqlStorage {
    /// Opens (creating if needed) the database at `dsn` and ensures the schema.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Connection`] if the database cannot be opened after retrying
    /// - [`StorageError::Query`] if the schema cannot be created
    pub async fn open(dsn: &str, backoff: BackoffSchedule) -> Result<Self, Report<StorageError>> {
        let path = dsn.to_string();
        let conn = backoff::retry(&backoff, is_retryable, |_| {
            let path = path.clone();
            async move {
                tokio::task::spawn_blocking(move || -> Result<Connection, Report<StorageError>> {
                    let conn = Connection::open(&path).map_err(|e| classify(e, "open database"))?;
                    conn.busy_timeout(Duration::from_secs(1))
                        .map_err(|e| classify(e, "configure database"))?;
                    conn.execute_batch(SCHEMA)
                        .map_err(|e| classify(e, "create schema"))?;
                    Ok(conn)
                })
                .await
                .change_context(StorageError::Connection {
                    message: "database task failed".into(),
                })?
            }
        })
        .await
        .attach_printable_lazy(|| format!("dsn: {dsn}"))?;

        info!(dsn, "SQL storage opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dsn: dsn.to_string(),
            backoff,
        })
    }

    /// Runs `op` on the connection, retrying connection-class failures.
    async fn with_conn<T, F>(&self, what: &'static str, op: F) -> Result<T, Report<StorageError>>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, Report<StorageError>> + Clone + Send + Sync + 'static,
    {
        let result = backoff::retry(&self.backoff, is_retryable, |_| {
            let conn = Arc::clone(&self.conn);
            let op = op.clone();
            async move {
                tokio::task::spawn_blocking(move || {
                    // a panicked statement leaves no open transaction behind
                    let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
                    op(&mut conn)
                })
                .await
                .change_context(StorageError::Query {
                    message: format!("{what}: database task failed"),
                })?
            }
        })
        .await;

        if let Err(err) = &result {
            match err.current_context() {
                StorageError::KindMismatch { .. } => {
                    debug!(dsn = %self.dsn, "{what} rejected: {err}");
                }
                _ => error!(dsn = %self.dsn, "{what} failed: {err:?}"),
            }
        }
        result
    }
}

fn is_retryable(err: &Report<StorageError>) -> bool {
    err.current_context().is_connection()
}

/// Splits SQLite failures into connection-class and everything else.
fn classify(err: rusqlite::Error, what: &str) -> Report<StorageError> {
    let connection = matches!(
        err.sqlite_error_code(),
        Some(
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
        )
    );
    let message = format!("{what}: {err}");
    if connection {
        Report::new(err).change_context(StorageError::Connection { message })
    } else {
        Report::new(err).change_context(StorageError::Query { message })
    }
}

fn read_value(
    id: &str,
    kind: &str,
    delta: Option<i64>,
    value: Option<f64>,
) -> Result<MetricValue, Report<StorageError>> {
    let malformed = || StorageError::Serialization {
        message: format!("row {id} has type {kind} without matching payload"),
    };
    match kind.parse::<MetricKind>().change_context_lazy(malformed)? {
        MetricKind::Gauge => value
            .map(MetricValue::Gauge)
            .ok_or_else(|| Report::new(malformed())),
        MetricKind::Counter => delta
            .map(MetricValue::Counter)
            .ok_or_else(|| Report::new(malformed())),
    }
}

fn select(conn: &Connection, id: &str) -> Result<Option<MetricValue>, Report<StorageError>> {
    let row = conn
        .query_row(
            "SELECT type, delta, value FROM metrics WHERE name = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                ))
            },
        )
        .optional()
        .map_err(|e| classify(e, "select metric"))?;
    row.map(|(kind, delta, value)| read_value(id, &kind, delta, value))
        .transpose()
}

/// Read-modify-write of one metric inside `tx`.
fn upsert(tx: &Transaction<'_>, record: &Record) -> Result<MetricValue, Report<StorageError>> {
    let merged = match select(tx, &record.id)? {
        Some(current) => merge(&record.id, current, record.value)?,
        None => record.value,
    };
    let (delta, value) = match merged {
        MetricValue::Gauge(v) => (None, Some(v)),
        MetricValue::Counter(d) => (Some(d), None),
    };
    tx.execute(
        "INSERT INTO metrics (name, type, delta, value) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET delta = excluded.delta, value = excluded.value",
        params![record.id, merged.kind().as_str(), delta, value],
    )
    .map_err(|e| classify(e, "upsert metric"))?;
    Ok(merged)
}

/// Applies `records` in one immediate transaction, rolled back on any failure.
fn write(
    conn: &mut Connection,
    records: &[Record],
) -> Result<Vec<MetricValue>, Report<StorageError>> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| classify(e, "begin transaction"))?;
    let merged = records
        .iter()
        .map(|record| upsert(&tx, record))
        .collect::<Result<Vec<_>, _>>()?;
    tx.commit().map_err(|e| classify(e, "commit transaction"))?;
    Ok(merged)
}

#[async_trait]
impl MetricStorage for SqlStorage {
    async fn add_gauge(&self, id: &str, value: f64) -> Result<(), Report<StorageError>> {
        let records = Arc::new(vec![Record::new(id, MetricValue::Gauge(value))]);
        self.with_conn("add gauge", move |conn| write(conn, &records))
            .await?;
        debug!(metric = %id, value, "gauge stored");
        Ok(())
    }

    async fn add_counter(&self, id: &str, delta: i64) -> Result<i64, Report<StorageError>> {
        let records = Arc::new(vec![Record::new(id, MetricValue::Counter(delta))]);
        let merged = self
            .with_conn("add counter", move |conn| write(conn, &records))
            .await?;
        let total = match merged.first() {
            Some(MetricValue::Counter(total)) => *total,
            _ => delta,
        };
        debug!(metric = %id, delta, total, "counter stored");
        Ok(total)
    }

    async fn get_metric(
        &self,
        id: &str,
        kind: MetricKind,
    ) -> Result<(Record, bool), Report<StorageError>> {
        let key = id.to_string();
        let stored = self
            .with_conn("get metric", move |conn| select(conn, &key))
            .await?
            .filter(|value| value.kind() == kind);
        Ok(match stored {
            Some(value) => (Record::new(id, value), true),
            None => (Record::new(id, MetricValue::zero(kind)), false),
        })
    }

    async fn get_all(&self) -> Result<Vec<Record>, Report<StorageError>> {
        self.with_conn("get all metrics", |conn| {
            let mut stmt = conn
                .prepare("SELECT name, type, delta, value FROM metrics")
                .map_err(|e| classify(e, "prepare select"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                    ))
                })
                .map_err(|e| classify(e, "select metrics"))?;
            let mut records = Vec::new();
            for row in rows {
                let (id, kind, delta, value) = row.map_err(|e| classify(e, "read row"))?;
                let value = read_value(&id, &kind, delta, value)?;
                records.push(Record::new(id, value));
            }
            Ok(records)
        })
        .await
    }

    async fn add_batch(&self, batch: &[Record]) -> Result<(), Report<StorageError>> {
        if batch.is_empty() {
            return Ok(());
        }
        let records = Arc::new(batch.to_vec());
        self.with_conn("add batch", move |conn| write(conn, &records))
            .await?;
        debug!(metrics = batch.len(), "batch stored");
        Ok(())
    }

    async fn ping(&self) -> Result<(), Report<StorageError>> {
        self.with_conn("ping", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| classify(e, "ping"))?;
            Ok(())
        })
        .await
    }
}
