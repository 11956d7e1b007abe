//! Metric storage backends.
//!
//! Both backends honour the same contract: gauges are replaced, counters are
//! summed, and a metric keeps the kind of its first update. Identity is the
//! metric name alone, so `Alloc` cannot exist as both a gauge and a counter.

mod memory;
mod sql;

use async_trait::async_trait;
use error_stack::Report;
use metrics_types::MetricError;
use metrics_types::MetricKind;
use metrics_types::MetricValue;
use metrics_types::Metrics;

pub use self::memory::MemStorage;
pub use self::sql::SqlStorage;
use crate::error::StorageError;

/// Stored state of one metric: its total for counters, its last value for gauges.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub value: MetricValue,
}

impl Record {
    pub fn new(id: impl Into<String>, value: MetricValue) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Validates an incoming envelope.
    ///
    /// # Errors
    ///
    /// Propagates [`Metrics::metric_value`] validation failures.
    pub fn from_envelope(metric: &Metrics) -> Result<Self, Report<MetricError>> {
        Ok(Self::new(metric.id.clone(), metric.metric_value()?))
    }

    pub fn to_envelope(&self) -> Metrics {
        Metrics::with_value(self.id.clone(), self.value)
    }
}

/// Applies `update` on top of `current`.
///
/// # Errors
///
/// - [`StorageError::KindMismatch`] if the kinds differ
pub fn merge(id: &str, current: MetricValue, update: MetricValue) -> Result<MetricValue, StorageError> {
    match (current, update) {
        (MetricValue::Gauge(_), MetricValue::Gauge(value)) => Ok(MetricValue::Gauge(value)),
        (MetricValue::Counter(total), MetricValue::Counter(delta)) => {
            Ok(MetricValue::Counter(total.saturating_add(delta)))
        }
        (current, update) => Err(StorageError::KindMismatch {
            id: id.to_string(),
            stored: current.kind(),
            requested: update.kind(),
        }),
    }
}

#[async_trait]
pub trait MetricStorage: Send + Sync {
    /// Replaces the value of gauge `id`.
    async fn add_gauge(&self, id: &str, value: f64) -> Result<(), Report<StorageError>>;

    /// Adds `delta` to counter `id` and returns the new total.
    async fn add_counter(&self, id: &str, delta: i64) -> Result<i64, Report<StorageError>>;

    /// Current record of `id` read as `kind`.
    ///
    /// Unknown metrics, and metrics stored with another kind, come back as the
    /// zero value of `kind` with `found == false`.
    async fn get_metric(
        &self,
        id: &str,
        kind: MetricKind,
    ) -> Result<(Record, bool), Report<StorageError>>;

    /// Every stored record, in no particular order.
    async fn get_all(&self) -> Result<Vec<Record>, Report<StorageError>>;

    /// Applies every update, all-or-nothing where the backend supports it.
    async fn add_batch(&self, batch: &[Record]) -> Result<(), Report<StorageError>>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<(), Report<StorageError>>;

    /// Applies one update according to its kind and returns the stored result.
    async fn update(&self, record: &Record) -> Result<Record, Report<StorageError>> {
        let value = match record.value {
            MetricValue::Gauge(value) => {
                self.add_gauge(&record.id, value).await?;
                MetricValue::Gauge(value)
            }
            MetricValue::Counter(delta) => {
                MetricValue::Counter(self.add_counter(&record.id, delta).await?)
            }
        };
        Ok(Record::new(record.id.clone(), value))
    }
}
