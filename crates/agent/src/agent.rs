//! Poll and report loops of the agent.
//!
//! The poll task is the only owner of the [`Sampler`]; after each pass it
//! publishes a copy of the snapshot on a watch channel. The report task reads
//! the latest copy on its own tick, so the two never touch the same value.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::aggregator::Snapshot;
use crate::batcher::Batcher;
use crate::config::AgentConfig;
use crate::config::ReportMode;
use crate::dispatcher::Dispatcher;
use crate::dispatcher::DispatcherStats;
use crate::dispatcher::Payload;
use crate::error::TransportError;
use crate::sampler::Sampler;
use crate::transport::HttpTransport;
use crate::transport::Transport;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the agent against the configured collector until `token` is cancelled.
///
/// # Errors
///
/// - [`TransportError::Configuration`] if the HTTP client cannot be built
pub async fn run(
    config: AgentConfig,
    token: CancellationToken,
) -> Result<Arc<DispatcherStats>, Report<TransportError>> {
    let transport = Arc::new(HttpTransport::new(&config)?);
    Ok(run_with(config, Sampler::with_default_sources(), transport, token).await)
}

/// Runs both loops with the given sampler and transport, then drains the
/// delivery queue. Returns the delivery counters once everything has stopped.
pub async fn run_with<T: Transport>(
    config: AgentConfig,
    sampler: Sampler,
    transport: Arc<T>,
    token: CancellationToken,
) -> Arc<DispatcherStats> {
    info!(
        server_url = %config.server_url,
        poll_interval = ?config.poll_interval,
        report_interval = ?config.report_interval,
        workers = config.workers,
        report_mode = ?config.report_mode,
        "starting agent"
    );

    let dispatcher = Dispatcher::start(
        transport,
        config.workers,
        config.queue_capacity,
        config.backoff.clone(),
    );
    let stats = dispatcher.stats();

    let (snapshot_tx, snapshot_rx) = watch::channel(sampler.snapshot().clone());
    let poll_task = spawn_poll_task(sampler, config.poll_interval, snapshot_tx, token.clone());

    report_loop(&config, &dispatcher, snapshot_rx, token).await;

    if let Err(err) = poll_task.await {
        error!("poll task failed: {err}");
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, dispatcher.close())
        .await
        .is_err()
    {
        warn!("delivery queue not drained after {DRAIN_TIMEOUT:?}");
    }

    info!(
        delivered = stats.delivered(),
        dropped = stats.dropped(),
        attempts = stats.attempts(),
        "agent stopped"
    );
    stats
}

fn spawn_poll_task(
    mut sampler: Sampler,
    poll_interval: Duration,
    snapshot_tx: watch::Sender<Snapshot>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // sysinfo reads /proc synchronously
            let pass = tokio::task::spawn_blocking(move || {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| sampler.poll()));
                (sampler, result)
            })
            .await;
            let result = match pass {
                Ok((returned, result)) => {
                    sampler = returned;
                    result
                }
                Err(err) => {
                    error!("sampling task failed, stopping poll task: {err}");
                    break;
                }
            };
            match result {
                Ok(snapshot) => {
                    snapshot_tx.send_replace(snapshot);
                }
                Err(_) => error!("sampling pass panicked, keeping previous snapshot"),
            }
        }
        debug!("poll task stopped");
    })
}

async fn report_loop(
    config: &AgentConfig,
    dispatcher: &Dispatcher,
    snapshot_rx: watch::Receiver<Snapshot>,
    token: CancellationToken,
) {
    let mut batcher = Batcher::new();
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.report_interval,
        config.report_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = snapshot_rx.borrow().clone();
        let metrics = batcher.prepare(&snapshot);
        debug!(poll_count = snapshot.poll_count, metrics = metrics.len(), "reporting");

        let payloads: Vec<Payload> = match config.report_mode {
            ReportMode::Batch => vec![Payload::Batch(metrics)],
            ReportMode::Single => metrics.into_iter().map(Payload::Single).collect(),
        };
        for payload in payloads {
            // waits for room in the queue; sampling keeps running meanwhile
            let submitted = tokio::select! {
                _ = token.cancelled() => return,
                submitted = dispatcher.submit(payload) => submitted,
            };
            if let Err(err) = submitted {
                error!("cannot queue report: {err:?}");
                return;
            }
        }
    }
    debug!("report loop stopped");
}
