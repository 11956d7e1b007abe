//! Shared metric type definitions
//!
//! This crate contains the wire types exchanged between the metrics agent and the
//! collector server: the metric kinds, the JSON envelope carried by `/update/` and
//! `/updates/`, and the keyed digest both sides compute over request bodies.

use core::error::Error;
use core::fmt;
use core::str::FromStr;

use error_stack::bail;
use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;

pub mod sign;

/// Kind of a metric. A metric keeps its kind for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Absolute value, last write wins.
    Gauge,
    /// Signed delta added to a running total.
    Counter,
}

impl MetricKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = Report<MetricError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => bail!(MetricError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// Typed payload of a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    /// Zero value of the given kind, used wherever a metric has no data yet.
    pub const fn zero(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Gauge => MetricValue::Gauge(0.0),
            MetricKind::Counter => MetricValue::Counter(0),
        }
    }

    pub const fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    /// Parses a raw textual value (as found in `/update/{type}/{name}/{value}`).
    ///
    /// # Errors
    ///
    /// - [`MetricError::InvalidValue`] if `raw` is not a float (gauge) or a
    ///   64-bit signed integer (counter)
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, Report<MetricError>> {
        let invalid = || MetricError::InvalidValue {
            kind,
            raw: raw.to_string(),
        };
        match kind {
            MetricKind::Gauge => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(MetricValue::Gauge)
                .ok_or_else(|| Report::new(invalid())),
            MetricKind::Counter => raw
                .parse::<i64>()
                .map(MetricValue::Counter)
                .map_err(|_| Report::new(invalid())),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(value) => write!(f, "{value}"),
            MetricValue::Counter(delta) => write!(f, "{delta}"),
        }
    }
}

/// Wire envelope for a single metric.
///
/// Exactly one of `value` (gauge) or `delta` (counter) is present in a valid
/// envelope. Requests for a metric (`POST /value/`) carry neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl Metrics {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self::with_value(id, MetricValue::Gauge(value))
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self::with_value(id, MetricValue::Counter(delta))
    }

    /// Envelope carrying the zero value of `kind`.
    pub fn zero(id: impl Into<String>, kind: MetricKind) -> Self {
        Self::with_value(id, MetricValue::zero(kind))
    }

    pub fn with_value(id: impl Into<String>, value: MetricValue) -> Self {
        let (delta, gauge) = match value {
            MetricValue::Gauge(v) => (None, Some(v)),
            MetricValue::Counter(d) => (Some(d), None),
        };
        Self {
            id: id.into(),
            kind: value.kind(),
            delta,
            value: gauge,
        }
    }

    /// Validates the envelope and extracts its typed payload.
    ///
    /// # Errors
    ///
    /// - [`MetricError::EmptyId`] if the id is blank
    /// - [`MetricError::MissingPayload`] if the field matching the kind is absent
    /// - [`MetricError::ConflictingPayload`] if both `value` and `delta` are set
    pub fn metric_value(&self) -> Result<MetricValue, Report<MetricError>> {
        if self.id.trim().is_empty() {
            bail!(MetricError::EmptyId);
        }
        match (self.kind, self.value, self.delta) {
            (_, Some(_), Some(_)) => bail!(MetricError::ConflictingPayload {
                id: self.id.clone(),
            }),
            (MetricKind::Gauge, Some(value), None) if value.is_finite() => {
                Ok(MetricValue::Gauge(value))
            }
            (MetricKind::Counter, None, Some(delta)) => Ok(MetricValue::Counter(delta)),
            (kind, _, _) => bail!(MetricError::MissingPayload {
                id: self.id.clone(),
                kind,
            }),
        }
    }
}

/// Errors raised while interpreting metric input.
#[derive(Debug, Clone, PartialEq, derive_more::Display)]
pub enum MetricError {
    #[display("Metric type is not supported: {kind}")]
    UnknownKind { kind: String },
    #[display("Metric id must not be empty")]
    EmptyId,
    #[display("Metric {id} of type {kind} has no usable payload")]
    MissingPayload { id: String, kind: MetricKind },
    #[display("Metric {id} carries both value and delta")]
    ConflictingPayload { id: String },
    #[display("Metric value not supported for {kind}: {raw}")]
    InvalidValue { kind: MetricKind, raw: String },
}

impl Error for MetricError {}
