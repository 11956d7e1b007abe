//! Fixed-size worker pool delivering payloads with retry.
//!
//! The pool is started once. Workers pull [`DeliveryUnit`]s from one shared
//! bounded queue and deliver them independently, so units handled by different
//! workers may arrive in any order. A unit gets exactly as many attempts as the
//! backoff schedule has entries; after that it is dropped and reported at ERROR
//! level. It is never re-queued.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use error_stack::Report;
use metrics_types::Metrics;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use utils::backoff;
use utils::backoff::BackoffSchedule;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::transport::Transport;

/// Unique identifier of a delivery unit, used to correlate log lines.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub struct UnitId(pub Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

/// What a unit carries to the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// One envelope, sent to `POST /update/`
    Single(Metrics),
    /// Every envelope of a report, sent to `POST /updates/`
    Batch(Vec<Metrics>),
}

impl Payload {
    /// Number of envelopes carried.
    pub fn len(&self) -> usize {
        match self {
            Payload::Single(_) => 1,
            Payload::Batch(batch) => batch.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle of a unit: `Pending -> Sending -> {Delivered | Retrying -> Sending | Dropped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum UnitState {
    Pending,
    Sending,
    Retrying,
    Delivered,
    Dropped,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::Delivered | UnitState::Dropped)
    }
}

/// A payload queued for delivery. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct DeliveryUnit {
    pub id: UnitId,
    pub payload: Payload,
}

impl DeliveryUnit {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: UnitId::new(),
            payload,
        }
    }
}

/// Delivery counters shared by all workers.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    attempts: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl DispatcherStats {
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

type SharedQueue = Arc<Mutex<mpsc::Receiver<DeliveryUnit>>>;

/// Handle to a running worker pool.
pub struct Dispatcher {
    sender: mpsc::Sender<DeliveryUnit>,
    stats: Arc<DispatcherStats>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawns `workers` long-lived delivery tasks on the current runtime.
    pub fn start<T: Transport>(
        transport: Arc<T>,
        workers: usize,
        queue_capacity: usize,
        schedule: BackoffSchedule,
    ) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let queue: SharedQueue = Arc::new(Mutex::new(receiver));
        let stats = Arc::new(DispatcherStats::default());

        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&transport),
                    Arc::clone(&queue),
                    schedule.clone(),
                    Arc::clone(&stats),
                ))
            })
            .collect();

        info!(workers, queue_capacity, attempts = schedule.attempts(), "dispatcher started");

        Self {
            sender,
            stats,
            workers: handles,
        }
    }

    /// Queues a payload, waiting for room when the queue is full.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::QueueClosed`] if every worker has exited
    pub async fn submit(&self, payload: Payload) -> Result<UnitId, Report<DispatchError>> {
        let unit = DeliveryUnit::new(payload);
        let id = unit.id;
        trace!(unit_id = %id, state = %UnitState::Pending, metrics = unit.payload.len(), "unit queued");
        self.sender
            .send(unit)
            .await
            .map_err(|_| Report::new(DispatchError::QueueClosed))?;
        Ok(id)
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Stops accepting units, lets the workers drain the queue and waits for them.
    pub async fn close(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!("delivery worker failed: {err}");
            }
        }
    }
}

async fn run_worker<T: Transport>(
    worker_id: usize,
    transport: Arc<T>,
    queue: SharedQueue,
    schedule: BackoffSchedule,
    stats: Arc<DispatcherStats>,
) {
    debug!(worker_id, "delivery worker started");
    loop {
        // the lock is only held while waiting for the next unit
        let next = queue.lock().await.recv().await;
        let Some(unit) = next else {
            break;
        };
        let state = deliver_unit(transport.as_ref(), &unit, &schedule, &stats).await;
        trace!(worker_id, unit_id = %unit.id, state = %state, "unit finished");
    }
    debug!(worker_id, "delivery worker stopped");
}

/// Drives one unit to a terminal state.
pub(crate) async fn deliver_unit<T: Transport>(
    transport: &T,
    unit: &DeliveryUnit,
    schedule: &BackoffSchedule,
    stats: &DispatcherStats,
) -> UnitState {
    let result = backoff::retry(schedule, |_| true, |attempt| {
        stats.attempts.fetch_add(1, Ordering::Relaxed);
        let state = if attempt == 0 {
            UnitState::Sending
        } else {
            UnitState::Retrying
        };
        trace!(unit_id = %unit.id, attempt = attempt + 1, %state, "sending unit");
        transport.deliver(&unit.payload)
    })
    .await;

    match result {
        Ok(()) => {
            stats.delivered.fetch_add(1, Ordering::Relaxed);
            UnitState::Delivered
        }
        Err(err) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            error!(
                unit_id = %unit.id,
                attempts = schedule.attempts(),
                metrics = unit.payload.len(),
                "dropping unit after exhausting retries: {err:?}"
            );
            UnitState::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use error_stack::bail;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::error::TransportError;

    /// Fails the first `failures` attempts of every unit, records what it saw.
    #[derive(Default)]
    struct ScriptedTransport {
        failures: usize,
        calls: AtomicU64,
        seen: StdMutex<Vec<Payload>>,
    }

    impl ScriptedTransport {
        fn failing(failures: usize) -> Self {
            Self {
                failures,
                ..Default::default()
            }
        }
    }

    impl Transport for ScriptedTransport {
        async fn deliver(&self, payload: &Payload) -> Result<(), Report<TransportError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let mut seen = self.seen.lock().expect("poisoned");
            let attempts_for_payload = seen.iter().filter(|p| *p == payload).count();
            seen.push(payload.clone());
            drop(seen);
            if attempts_for_payload < self.failures {
                bail!(TransportError::Http {
                    status: 500,
                    message: format!("scripted failure #{call}"),
                });
            }
            Ok(())
        }
    }

    fn fast_schedule() -> BackoffSchedule {
        BackoffSchedule::new([
            Duration::from_millis(10),
            Duration::from_millis(30),
            Duration::from_millis(50),
        ])
    }

    #[test(tokio::test(start_paused = true))]
    async fn permanently_failing_unit_is_attempted_schedule_length_times_then_dropped() {
        let transport = Arc::new(ScriptedTransport::failing(usize::MAX));
        let dispatcher = Dispatcher::start(Arc::clone(&transport), 2, 8, fast_schedule());
        let stats = dispatcher.stats();

        dispatcher
            .submit(Payload::Single(Metrics::gauge("Alloc", 1.0)))
            .await
            .expect("queue open");
        dispatcher.close().await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.attempts(), 3);
        assert_eq!(stats.dropped(), 1);
        assert_eq!(stats.delivered(), 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn transient_failure_is_retried_until_delivered() {
        let transport = Arc::new(ScriptedTransport::failing(2));
        let dispatcher = Dispatcher::start(Arc::clone(&transport), 1, 8, fast_schedule());
        let stats = dispatcher.stats();

        dispatcher
            .submit(Payload::Batch(vec![Metrics::counter("PollCount", 4)]))
            .await
            .expect("queue open");
        dispatcher.close().await;

        assert_eq!(stats.attempts(), 3);
        assert_eq!(stats.delivered(), 1);
        assert_eq!(stats.dropped(), 0);
    }

    #[test(tokio::test(start_paused = true))]
    async fn every_queued_unit_reaches_a_terminal_state() {
        let transport = Arc::new(ScriptedTransport::default());
        let dispatcher = Dispatcher::start(Arc::clone(&transport), 3, 4, fast_schedule());
        let stats = dispatcher.stats();

        let mut ids = HashSet::new();
        for i in 0..20 {
            let id = dispatcher
                .submit(Payload::Single(Metrics::counter(format!("c{i}"), i)))
                .await
                .expect("queue open");
            ids.insert(id);
        }
        dispatcher.close().await;

        assert_eq!(ids.len(), 20);
        assert_eq!(stats.delivered(), 20);
        assert_eq!(transport.seen.lock().expect("poisoned").len(), 20);
    }

    #[test(tokio::test(start_paused = true))]
    async fn deliver_unit_reports_terminal_state() {
        let stats = DispatcherStats::default();
        let unit = DeliveryUnit::new(Payload::Batch(Vec::new()));

        let state = deliver_unit(&ScriptedTransport::default(), &unit, &fast_schedule(), &stats).await;
        assert_eq!(state, UnitState::Delivered);
        assert!(state.is_terminal());

        let state =
            deliver_unit(&ScriptedTransport::failing(9), &unit, &fast_schedule(), &stats).await;
        assert_eq!(state, UnitState::Dropped);
        assert_eq!(stats.attempts(), 4);
    }

    #[test]
    fn payload_len_counts_envelopes() {
        assert_eq!(Payload::Single(Metrics::gauge("a", 1.0)).len(), 1);
        assert!(Payload::Batch(Vec::new()).is_empty());
    }
}
