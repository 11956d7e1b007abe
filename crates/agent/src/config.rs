use std::time::Duration;

use clap::Parser;
use clap::ValueEnum;
use utils::backoff::BackoffSchedule;
use utils::version;

/// How a report tick hands metrics to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportMode {
    /// One `POST /updates/` per report tick carrying every metric.
    Batch,
    /// One `POST /update/` per metric.
    Single,
}

#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct AgentArgs {
    #[arg(
        short = 'a',
        long,
        env = "ADDRESS",
        default_value = "localhost:8080",
        help = "Collector address, host:port or a full http(s) URL"
    )]
    pub address: String,

    #[arg(
        short = 'p',
        long,
        env = "POLL_INTERVAL",
        default_value_t = 2,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between two sampling passes"
    )]
    pub poll_interval: u64,

    #[arg(
        short = 'r',
        long,
        env = "REPORT_INTERVAL",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between two reports to the collector"
    )]
    pub report_interval: u64,

    #[arg(
        short = 'k',
        long,
        env = "KEY",
        help = "Shared secret used to sign request bodies (HashSHA256 header)"
    )]
    pub key: Option<String>,

    #[arg(
        short = 'l',
        long,
        env = "RATE_LIMIT",
        default_value_t = 2,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Number of delivery workers"
    )]
    pub rate_limit: u64,

    #[arg(
        long,
        env = "REPORT_MODE",
        value_enum,
        default_value_t = ReportMode::Batch,
        help = "Send one batch per report or one request per metric"
    )]
    pub report_mode: ReportMode,

    #[arg(
        long,
        env = "REQUEST_TIMEOUT",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Per-attempt HTTP timeout in seconds"
    )]
    pub request_timeout: u64,
}

/// Agent configuration, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// base url of the collector, without trailing slash
    pub server_url: String,
    pub poll_interval: Duration,
    pub report_interval: Duration,
    pub key: Option<String>,
    pub workers: usize,
    pub report_mode: ReportMode,
    pub request_timeout: Duration,
    pub backoff: BackoffSchedule,
    /// capacity of the shared delivery queue
    pub queue_capacity: usize,
}

impl AgentConfig {
    pub fn new(server_url: impl AsRef<str>) -> Self {
        Self {
            server_url: normalize_url(server_url.as_ref()),
            poll_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            key: None,
            workers: 2,
            report_mode: ReportMode::Batch,
            request_timeout: Duration::from_secs(5),
            backoff: BackoffSchedule::default(),
            queue_capacity: 64,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_report_mode(mut self, mode: ReportMode) -> Self {
        self.report_mode = mode;
        self
    }

    pub fn with_intervals(mut self, poll: Duration, report: Duration) -> Self {
        self.poll_interval = poll;
        self.report_interval = report;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.backoff = backoff;
        self
    }
}

impl From<AgentArgs> for AgentConfig {
    fn from(args: AgentArgs) -> Self {
        let workers = usize::try_from(args.rate_limit).unwrap_or(usize::MAX);
        Self {
            key: args.key.filter(|k| !k.is_empty()),
            report_mode: args.report_mode,
            request_timeout: Duration::from_secs(args.request_timeout),
            queue_capacity: workers.saturating_mul(16),
            ..AgentConfig::new(&args.address)
                .with_workers(workers)
                .with_intervals(
                    Duration::from_secs(args.poll_interval),
                    Duration::from_secs(args.report_interval),
                )
        }
    }
}

fn normalize_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = AgentArgs::try_parse_from(["agent"]).expect("defaults parse");
        let config = AgentConfig::from(args);

        assert_eq!(config.server_url, "http://localhost:8080");
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.report_interval, Duration::from_secs(10));
        assert_eq!(config.workers, 2);
        assert_eq!(config.report_mode, ReportMode::Batch);
        assert!(config.key.is_none());
        assert_eq!(config.backoff, BackoffSchedule::default());
    }

    #[test]
    fn flags_override_defaults() {
        let args = AgentArgs::try_parse_from([
            "agent",
            "-a",
            "https://collector:9000/",
            "-p",
            "1",
            "-r",
            "4",
            "-k",
            "secret",
            "-l",
            "5",
            "--report-mode",
            "single",
        ])
        .expect("flags parse");
        let config = AgentConfig::from(args);

        assert_eq!(config.server_url, "https://collector:9000");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.report_interval, Duration::from_secs(4));
        assert_eq!(config.key.as_deref(), Some("secret"));
        assert_eq!(config.workers, 5);
        assert_eq!(config.report_mode, ReportMode::Single);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(AgentArgs::try_parse_from(["agent", "-p", "0"]).is_err());
        assert!(AgentArgs::try_parse_from(["agent", "-l", "0"]).is_err());
    }
}
