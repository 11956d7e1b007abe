use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use error_stack::Report;
use metrics_types::MetricKind;
use metrics_types::MetricValue;
use tracing::debug;

use super::merge;
use super::MetricStorage;
use super::Record;
use crate::error::StorageError;

/// In-process store. Each update holds the shard lock of its key for the whole
/// read-modify-write, so concurrent counter updates never lose a delta.
#[derive(Debug, Default)]
pub struct MemStorage {
    records: DashMap<String, MetricValue>,
    // single updates share it, a batch holds it exclusively from check to last write
    batch_guard: RwLock<()>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `records`, later entries winning over earlier ones.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let storage = Self::new();
        storage.replace_all(records);
        storage
    }

    /// Swaps the whole record set. Only used to seed a store before it serves.
    pub fn replace_all(&self, records: impl IntoIterator<Item = Record>) {
        self.records.clear();
        for record in records {
            self.records.insert(record.id, record.value);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn upsert(&self, id: &str, update: MetricValue) -> Result<MetricValue, Report<StorageError>> {
        let _shared = self
            .batch_guard
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        self.upsert_unguarded(id, update)
    }

    fn upsert_unguarded(
        &self,
        id: &str,
        update: MetricValue,
    ) -> Result<MetricValue, Report<StorageError>> {
        match self.records.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                let merged = merge(id, *entry.get(), update)?;
                entry.insert(merged);
                Ok(merged)
            }
            Entry::Vacant(entry) => {
                entry.insert(update);
                Ok(update)
            }
        }
    }

    /// Fails if any update in `batch` would change the kind of a stored metric or
    /// of an earlier update in the same batch.
    fn check_kinds(&self, batch: &[Record]) -> Result<(), Report<StorageError>> {
        let mut seen: HashMap<&str, MetricKind> = HashMap::new();
        for record in batch {
            let stored = seen
                .get(record.id.as_str())
                .copied()
                .or_else(|| self.records.get(&record.id).map(|v| v.kind()));
            if let Some(stored) = stored {
                if stored != record.kind() {
                    return Err(Report::new(StorageError::KindMismatch {
                        id: record.id.clone(),
                        stored,
                        requested: record.kind(),
                    }));
                }
            }
            seen.insert(&record.id, record.kind());
        }
        Ok(())
    }
}

#[async_trait]
impl MetricStorage for MemStorage {
    async fn add_gauge(&self, id: &str, value: f64) -> Result<(), Report<StorageError>> {
        self.upsert(id, MetricValue::Gauge(value))?;
        debug!(metric = %id, value, "gauge stored");
        Ok(())
    }

    async fn add_counter(&self, id: &str, delta: i64) -> Result<i64, Report<StorageError>> {
        let total = match self.upsert(id, MetricValue::Counter(delta))? {
            MetricValue::Counter(total) => total,
            MetricValue::Gauge(_) => unreachable!("merge keeps the counter kind"),
        };
        debug!(metric = %id, delta, total, "counter stored");
        Ok(total)
    }

    async fn get_metric(
        &self,
        id: &str,
        kind: MetricKind,
    ) -> Result<(Record, bool), Report<StorageError>> {
        let stored = self
            .records
            .get(id)
            .map(|value| *value)
            .filter(|value| value.kind() == kind);
        Ok(match stored {
            Some(value) => (Record::new(id, value), true),
            None => (Record::new(id, MetricValue::zero(kind)), false),
        })
    }

    async fn get_all(&self) -> Result<Vec<Record>, Report<StorageError>> {
        Ok(self
            .records
            .iter()
            .map(|entry| Record::new(entry.key().clone(), *entry.value()))
            .collect())
    }

    async fn add_batch(&self, batch: &[Record]) -> Result<(), Report<StorageError>> {
        let _exclusive = self
            .batch_guard
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.check_kinds(batch)?;
        for record in batch {
            self.upsert_unguarded(&record.id, record.value)?;
        }
        debug!(metrics = batch.len(), "batch stored");
        Ok(())
    }

    async fn ping(&self) -> Result<(), Report<StorageError>> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;

    use super::*;

    #[tokio::test]
    async fn counter_accumulates_and_gauge_replaces() {
        let storage = MemStorage::new();

        storage.add_counter("PollCount", 5).await.expect("add");
        assert_eq!(storage.add_counter("PollCount", 5).await.expect("add"), 10);
        storage.add_gauge("Alloc", 1.5).await.expect("add");
        storage.add_gauge("Alloc", 125.44).await.expect("add");

        let (counter, found) = storage
            .get_metric("PollCount", MetricKind::Counter)
            .await
            .expect("get");
        assert!(found);
        assert_eq!(counter.value, MetricValue::Counter(10));

        let (gauge, _) = storage
            .get_metric("Alloc", MetricKind::Gauge)
            .await
            .expect("get");
        assert_eq!(gauge.value, MetricValue::Gauge(125.44));
    }

    #[tokio::test]
    async fn unknown_metric_reads_as_zero_of_requested_kind() {
        let storage = MemStorage::new();

        let (record, found) = storage
            .get_metric("Unseen", MetricKind::Counter)
            .await
            .expect("get");
        assert!(!found);
        assert_eq!(record, Record::new("Unseen", MetricValue::Counter(0)));
    }

    #[tokio::test]
    async fn kind_of_stored_metric_never_changes() {
        let storage = MemStorage::new();
        storage.add_counter("PollCount", 3).await.expect("add");

        let err = storage.add_gauge("PollCount", 1.0).await.expect_err("mismatch");
        assert!(matches!(err.current_context(), StorageError::KindMismatch { .. }));

        let (as_gauge, found) = storage
            .get_metric("PollCount", MetricKind::Gauge)
            .await
            .expect("get");
        assert!(!found);
        assert_eq!(as_gauge.value, MetricValue::Gauge(0.0));

        let (as_counter, _) = storage
            .get_metric("PollCount", MetricKind::Counter)
            .await
            .expect("get");
        assert_eq!(as_counter.value, MetricValue::Counter(3));
    }

    #[tokio::test]
    async fn mismatching_batch_is_rejected_before_any_write() {
        let storage = MemStorage::new();
        storage.add_gauge("Alloc", 1.0).await.expect("add");

        let batch = vec![
            Record::new("PollCount", MetricValue::Counter(1)),
            Record::new("Alloc", MetricValue::Counter(1)),
        ];
        assert!(storage.add_batch(&batch).await.is_err());
        assert_eq!(storage.len(), 1);

        let inconsistent = vec![
            Record::new("x", MetricValue::Counter(1)),
            Record::new("x", MetricValue::Gauge(1.0)),
        ];
        assert!(storage.add_batch(&inconsistent).await.is_err());
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_counter_updates_are_not_lost() {
        let storage = Arc::new(MemStorage::new());

        let tasks: Vec<_> = (1..=50)
            .map(|delta| {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    for _ in 0..20 {
                        storage.add_counter("hits", delta).await.expect("add");
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join");
        }

        let (record, _) = storage
            .get_metric("hits", MetricKind::Counter)
            .await
            .expect("get");
        // 20 * (1 + 2 + ... + 50)
        assert_eq!(record.value, MetricValue::Counter(25_500));
    }

    #[tokio::test]
    async fn replace_all_swaps_record_set() {
        let storage = MemStorage::from_records([Record::new("a", MetricValue::Gauge(1.0))]);
        storage.replace_all([Record::new("b", MetricValue::Counter(2))]);

        let all = storage.get_all().await.expect("all");
        assert_eq!(all, vec![Record::new("b", MetricValue::Counter(2))]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batch_racing_a_conflicting_update_is_all_or_nothing() {
        let storage = Arc::new(MemStorage::new());

        let batches: Vec<_> = (0..20)
            .map(|i| {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    let mut batch: Vec<Record> = (0..200)
                        .map(|j| Record::new(format!("b{i}_{j}"), MetricValue::Counter(1)))
                        .collect();
                    batch.push(Record::new("x", MetricValue::Counter(1)));
                    (i, storage.add_batch(&batch).await.is_ok())
                })
            })
            .collect();
        let gauges: Vec<_> = (0..20)
            .map(|_| {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    let _ = storage.add_gauge("x", 1.0).await;
                })
            })
            .collect();

        for gauge in gauges {
            gauge.await.expect("join");
        }
        for batch in batches {
            let (i, applied) = batch.await.expect("join");
            let stored = (0..200)
                .filter(|j| storage.records.contains_key(&format!("b{i}_{j}")))
                .count();
            assert_eq!(stored, if applied { 200 } else { 0 }, "batch {i}");
        }
    }
}
