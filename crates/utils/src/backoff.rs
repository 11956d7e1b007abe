//! Fixed backoff schedule shared by every retrying component.

use core::fmt::Display;
use core::future::Future;
use std::time::Duration;

use tracing::warn;

/// Ordered list of waits between delivery attempts.
///
/// A schedule of `n` entries allows exactly `n` attempts: after a failed attempt `i`
/// the caller waits `delays[i]` before attempt `i + 1`. An empty schedule still
/// allows a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn new(delays: impl Into<Vec<Duration>>) -> Self {
        Self {
            delays: delays.into(),
        }
    }

    /// Number of attempts a unit of work gets before it is given up.
    pub fn attempts(&self) -> usize {
        self.delays.len().max(1)
    }

    /// Wait after the failed attempt with the given zero-based index.
    pub fn delay(&self, attempt: usize) -> Duration {
        self.delays.get(attempt).copied().unwrap_or_default()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new([
            Duration::from_secs(1),
            Duration::from_secs(3),
            Duration::from_secs(5),
        ])
    }
}

/// Runs `op` until it succeeds, the schedule is exhausted, or it fails with an
/// error `is_retryable` rejects. The closure receives the zero-based attempt index.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub async fn retry<T, E, F, Fut, P>(
    schedule: &BackoffSchedule,
    is_retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let attempts = schedule.attempts();
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt + 1 >= attempts || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = schedule.delay(attempt);
                warn!(
                    attempt = attempt + 1,
                    attempts,
                    retry_in = ?delay,
                    "attempt failed: {err}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
