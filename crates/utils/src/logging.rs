//! provides logging helpers

use std::env;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Directory for rolling log files. Stderr only when unset.
pub const LOG_PATH_ENV_VAR: &str = "LOG_PATH";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// `file_prefix` names the rolling log files written under `LOG_PATH`. The returned
/// guard flushes the file writer on drop and must be held until the process exits.
pub fn init(file_prefix: &str) -> Option<WorkerGuard> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let mut appender_error = None;
    let (file_layer, guard) = match env::var(LOG_PATH_ENV_VAR) {
        Ok(log_dir) => match RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(file_prefix)
            .max_log_files(3)
            .build(&log_dir)
        {
            Ok(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let file_layer = layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(env_filter());
                (Some(file_layer), Some(guard))
            }
            Err(err) => {
                appender_error = Some(format!("{log_dir}: {err}"));
                (None, None)
            }
        },
        Err(_) => (None, None),
    };

    registry().with(stderr_layer).with(file_layer).init();

    if let Some(err) = appender_error {
        tracing::error!("failed to create rolling file appender at {err}; logging to stderr only");
    }
    guard
}
