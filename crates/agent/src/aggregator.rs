//! Snapshot of every tracked metric and the static table describing them.
//!
//! The table is the single source of truth for which metrics the agent reports:
//! each entry names a metric, fixes its kind and reads its value out of a
//! [`Snapshot`]. The batcher walks it in order, so every known metric appears
//! exactly once per report.

use metrics_types::MetricKind;
use metrics_types::MetricValue;

/// Values captured by one sampling pass.
///
/// Fields start at zero, so a metric with no data yet reports the zero value of
/// its kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// resident memory of the agent process, bytes
    pub alloc: u64,
    /// virtual memory of the agent process, bytes
    pub sys: u64,
    /// CPU usage of the agent process, percent of one core
    pub process_cpu_usage: f32,
    /// seconds since the agent process started
    pub run_time: u64,
    pub disk_read_bytes: u64,
    pub disk_written_bytes: u64,

    pub total_memory: u64,
    pub free_memory: u64,
    pub used_memory: u64,
    /// host-wide CPU utilisation, percent
    pub cpu_utilization: f32,
    pub num_cpu: u32,

    pub random_value: f64,

    /// number of completed sampling passes, never decreases
    pub poll_count: u64,
}

/// One row of the metric table.
#[derive(Clone, Copy)]
pub struct MetricDescriptor {
    pub name: &'static str,
    pub kind: MetricKind,
    read: fn(&Snapshot) -> MetricValue,
}

impl MetricDescriptor {
    const fn gauge(name: &'static str, read: fn(&Snapshot) -> MetricValue) -> Self {
        Self {
            name,
            kind: MetricKind::Gauge,
            read,
        }
    }

    const fn counter(name: &'static str, read: fn(&Snapshot) -> MetricValue) -> Self {
        Self {
            name,
            kind: MetricKind::Counter,
            read,
        }
    }

    /// Current value of this metric in `snapshot`. Counters report their running
    /// total; turning it into a delta is up to the batcher.
    pub fn read(&self, snapshot: &Snapshot) -> MetricValue {
        (self.read)(snapshot)
    }
}

impl core::fmt::Debug for MetricDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MetricDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

// u64 sources are converted with `as`: exact up to 2^53, nearest double above.
fn bytes(value: u64) -> MetricValue {
    MetricValue::Gauge(value as f64)
}

fn total(value: u64) -> MetricValue {
    MetricValue::Counter(i64::try_from(value).unwrap_or(i64::MAX))
}

/// Every metric the agent reports.
pub static METRICS: &[MetricDescriptor] = &[
    MetricDescriptor::gauge("Alloc", |s| bytes(s.alloc)),
    MetricDescriptor::gauge("Sys", |s| bytes(s.sys)),
    MetricDescriptor::gauge("ProcessCPUUsage", |s| {
        MetricValue::Gauge(f64::from(s.process_cpu_usage))
    }),
    MetricDescriptor::gauge("RunTime", |s| bytes(s.run_time)),
    MetricDescriptor::gauge("DiskReadBytes", |s| bytes(s.disk_read_bytes)),
    MetricDescriptor::gauge("DiskWrittenBytes", |s| bytes(s.disk_written_bytes)),
    MetricDescriptor::gauge("TotalMemory", |s| bytes(s.total_memory)),
    MetricDescriptor::gauge("FreeMemory", |s| bytes(s.free_memory)),
    MetricDescriptor::gauge("UsedMemory", |s| bytes(s.used_memory)),
    MetricDescriptor::gauge("CPUutilization1", |s| {
        MetricValue::Gauge(f64::from(s.cpu_utilization))
    }),
    MetricDescriptor::gauge("NumCPU", |s| MetricValue::Gauge(f64::from(s.num_cpu))),
    MetricDescriptor::gauge("RandomValue", |s| MetricValue::Gauge(s.random_value)),
    MetricDescriptor::counter("PollCount", |s| total(s.poll_count)),
];

/// Looks a metric up by name.
pub fn descriptor(name: &str) -> Option<&'static MetricDescriptor> {
    METRICS.iter().find(|d| d.name == name)
}
