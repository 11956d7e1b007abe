use std::collections::HashMap;

use metrics_types::MetricValue;
use metrics_types::Metrics;

use crate::aggregator::Snapshot;
use crate::aggregator::METRICS;

/// Turns snapshots into envelopes, one per known metric.
///
/// Counters are reported as the difference between the running total in the
/// snapshot and the total handed out by the previous call, so the collector's
/// sum over all reports equals the agent's total.
#[derive(Debug, Default)]
pub struct Batcher {
    reported: HashMap<&'static str, i64>,
}

impl Batcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepare(&mut self, snapshot: &Snapshot) -> Vec<Metrics> {
        METRICS
            .iter()
            .map(|descriptor| match descriptor.read(snapshot) {
                MetricValue::Gauge(value) => Metrics::gauge(descriptor.name, value),
                MetricValue::Counter(total) => {
                    let previous = self.reported.insert(descriptor.name, total).unwrap_or(0);
                    Metrics::counter(descriptor.name, total.saturating_sub(previous))
                }
            })
            .collect()
    }
}
