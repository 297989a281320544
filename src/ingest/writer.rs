//! Resilient bulk writer for the graph store.
//!
//! A call is split into sub-batches of at most `batch_size`. Each sub-batch is
//! retried on transient errors; when retries run out it is re-split following
//! `n → n/2 → n/10 → 1` so the failing records are isolated, and whatever still
//! fails as a single record goes to the dead-letter log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Serialize;

use super::dead_letter::DeadLetterLog;
use crate::config::WriterConfig;
use crate::error::{StoreError, WriteError};
use crate::metrics::PipelineMetrics;
use crate::models::{DeadLetterRecord, Entity, Relationship};
use crate::storage::GraphStore;

/// Delay schedule kept for compatibility with existing deployments.
pub const DEFAULT_RETRY_DELAYS_SECS: [u64; 5] = [1, 2, 4, 8, 16];

#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed table; the last entry repeats once attempts run past its end.
    Table(Vec<Duration>),
    /// `min(base * 2^attempt, max)`
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn table(max_retries: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Table(delays),
        }
    }

    pub fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Table(delays) => delays
                .get(attempt as usize)
                .or_else(|| delays.last())
                .copied()
                .unwrap_or(Duration::ZERO),
            Backoff::Exponential { base, max } => base
                .checked_mul(2u32.saturating_pow(attempt))
                .map_or(*max, |d| d.min(*max)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::table(
            DEFAULT_RETRY_DELAYS_SECS.len() as u32,
            DEFAULT_RETRY_DELAYS_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }
}

/// Retry bookkeeping for one sub-batch write.
#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempt: u32,
    next_delay: Duration,
}

/// Micro-batch sizes tried after a sub-batch of `len` exhausts its retries.
pub fn degradation_sizes(len: usize) -> Vec<usize> {
    let mut sizes: Vec<usize> = Vec::with_capacity(3);
    for candidate in [len / 2, len / 10, 1] {
        let ceiling = sizes.last().copied().unwrap_or(len);
        if candidate >= 1 && candidate < ceiling {
            sizes.push(candidate);
        }
    }
    sizes
}

/// A record kind the writer knows how to upsert.
pub trait GraphRecord: Serialize + Send + Sync + Sized {
    /// Stage name written to dead-letter records.
    const STAGE: &'static str;

    fn upsert<'a>(
        store: &'a dyn GraphStore,
        batch: &'a [Self],
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

impl GraphRecord for Entity {
    const STAGE: &'static str = "write_entities";

    fn upsert<'a>(
        store: &'a dyn GraphStore,
        batch: &'a [Self],
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        store.upsert_entities(batch)
    }
}

impl GraphRecord for Relationship {
    const STAGE: &'static str = "write_relationships";

    fn upsert<'a>(
        store: &'a dyn GraphStore,
        batch: &'a [Self],
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        store.upsert_relationships(batch)
    }
}

pub struct BulkGraphWriter {
    store: Arc<dyn GraphStore>,
    batch_size: usize,
    retry: RetryPolicy,
    dead_letters: Arc<DeadLetterLog>,
    metrics: Arc<PipelineMetrics>,
}

impl BulkGraphWriter {
    pub fn new(
        store: Arc<dyn GraphStore>,
        batch_size: usize,
        retry: RetryPolicy,
        dead_letters: Arc<DeadLetterLog>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            retry,
            dead_letters,
            metrics,
        }
    }

    pub fn from_config(
        config: &WriterConfig,
        store: Arc<dyn GraphStore>,
        dead_letters: Arc<DeadLetterLog>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let delays = if config.retry_delays_secs.is_empty() {
            DEFAULT_RETRY_DELAYS_SECS.to_vec()
        } else {
            config.retry_delays_secs.clone()
        };
        let retry = RetryPolicy::table(
            config.max_retries,
            delays.into_iter().map(Duration::from_secs).collect(),
        );
        Self::new(store, config.batch_size, retry, dead_letters, metrics)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Upsert entities; returns how many were written.
    pub async fn write_entities(&self, batch: &[Entity]) -> Result<usize, WriteError> {
        self.write_all(batch).await
    }

    /// Upsert relationships; returns how many were written.
    pub async fn write_relationships(&self, batch: &[Relationship]) -> Result<usize, WriteError> {
        self.write_all(batch).await
    }

    async fn write_all<R: GraphRecord>(&self, batch: &[R]) -> Result<usize, WriteError> {
        let mut written = 0usize;
        let mut failed = 0usize;
        let mut first_error: Option<StoreError> = None;

        for chunk in batch.chunks(self.batch_size) {
            match self.write_with_retry(chunk).await {
                Ok(()) => written += chunk.len(),
                Err(err) => {
                    tracing::warn!(
                        "{}: sub-batch of {} failed after retries, degrading: {}",
                        R::STAGE,
                        chunk.len(),
                        err
                    );
                    if first_error.is_none() {
                        first_error = Some(err.clone());
                    }
                    let (ok, bad) = self.degrade(chunk, err).await;
                    written += ok;
                    failed += bad;
                }
            }
        }

        match first_error {
            Some(source) if written == 0 && failed > 0 => {
                Err(WriteError::Exhausted { failed, source })
            }
            _ => {
                if failed > 0 {
                    tracing::warn!(
                        "{}: wrote {} of {} records, {} dead-lettered",
                        R::STAGE,
                        written,
                        batch.len(),
                        failed
                    );
                }
                Ok(written)
            }
        }
    }

    /// Re-split a failed sub-batch level by level. Returns (written, dead-lettered).
    async fn degrade<R: GraphRecord>(&self, chunk: &[R], err: StoreError) -> (usize, usize) {
        let levels = degradation_sizes(chunk.len());
        let mut written = 0usize;
        let mut failed = 0usize;

        let mut pending: VecDeque<(&[R], usize, StoreError)> = VecDeque::new();
        pending.push_back((chunk, 0, err));

        while let Some((records, level, err)) = pending.pop_front() {
            let Some(&size) = levels.get(level) else {
                for record in records {
                    self.dead_letter(record, &err).await;
                }
                failed += records.len();
                continue;
            };

            PipelineMetrics::incr(&self.metrics.write_degradations);
            tracing::debug!(
                "{}: retrying {} records in micro-batches of {}",
                R::STAGE,
                records.len(),
                size
            );

            for micro in records.chunks(size) {
                match self.write_with_retry(micro).await {
                    Ok(()) => written += micro.len(),
                    Err(e) if size == 1 => {
                        self.dead_letter(&micro[0], &e).await;
                        failed += 1;
                    }
                    Err(e) => pending.push_back((micro, level + 1, e)),
                }
            }
        }

        (written, failed)
    }

    async fn write_with_retry<R: GraphRecord>(&self, records: &[R]) -> Result<(), StoreError> {
        let mut state = RetryState {
            attempt: 0,
            next_delay: self.retry.delay_for(0),
        };

        loop {
            let start = Instant::now();
            let result = R::upsert(self.store.as_ref(), records).await;
            self.metrics.record_write(records.len(), start.elapsed());

            match result {
                Ok(()) => {
                    PipelineMetrics::add(&self.metrics.records_written, records.len() as u64);
                    return Ok(());
                }
                Err(e) if e.is_transient() && state.attempt < self.retry.max_retries => {
                    tracing::warn!(
                        "{}: transient failure on {} records (attempt {}/{}), retrying in {:?}: {}",
                        R::STAGE,
                        records.len(),
                        state.attempt + 1,
                        self.retry.max_retries + 1,
                        state.next_delay,
                        e
                    );
                    PipelineMetrics::incr(&self.metrics.write_retries);
                    tokio::time::sleep(state.next_delay).await;
                    state.attempt += 1;
                    state.next_delay = self.retry.delay_for(state.attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dead_letter<R: GraphRecord>(&self, record: &R, err: &StoreError) {
        let item = serde_json::to_value(record)
            .unwrap_or_else(|e| serde_json::json!({ "unserializable": e.to_string() }));
        self.dead_letters
            .record(DeadLetterRecord::new(R::STAGE, err, item))
            .await;
        PipelineMetrics::incr(&self.metrics.dead_lettered);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory store that rejects entities whose id starts with "bad" and can
    /// fail the first N calls with a transient error.
    #[derive(Default)]
    pub struct FakeStore {
        pub entities: Mutex<Vec<Entity>>,
        pub relationships: Mutex<Vec<Relationship>>,
        pub calls: Mutex<Vec<usize>>,
        pub transient_failures: AtomicUsize,
        pub always_transient: bool,
    }

    impl FakeStore {
        pub fn flaky(failures: usize) -> Self {
            Self {
                transient_failures: AtomicUsize::new(failures),
                ..Self::default()
            }
        }

        pub fn entity_ids(&self) -> Vec<String> {
            self.entities
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.id.clone())
                .collect()
        }

        fn check_transient(&self) -> Result<(), StoreError> {
            if self.always_transient {
                return Err(StoreError::Transient("lock timeout".into()));
            }
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Transient("connection reset".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl GraphStore for FakeStore {
        async fn upsert_entities(&self, batch: &[Entity]) -> Result<(), StoreError> {
            self.calls.lock().unwrap().push(batch.len());
            self.check_transient()?;
            if let Some(bad) = batch.iter().find(|e| e.id.starts_with("bad")) {
                return Err(StoreError::Malformed(format!("rejected {}", bad.id)));
            }
            let mut stored = self.entities.lock().unwrap();
            for entity in batch {
                stored.retain(|e| e.id != entity.id);
                stored.push(entity.clone());
            }
            Ok(())
        }

        async fn upsert_relationships(&self, batch: &[Relationship]) -> Result<(), StoreError> {
            self.calls.lock().unwrap().push(batch.len());
            self.check_transient()?;
            self.relationships.lock().unwrap().extend_from_slice(batch);
            Ok(())
        }
    }

    fn entities(n: usize) -> Vec<Entity> {
        (0..n)
            .map(|i| Entity::new(format!("table:{}", i), "Table"))
            .collect()
    }

    fn writer(
        store: Arc<FakeStore>,
        batch_size: usize,
        max_retries: u32,
        dir: &TempDir,
    ) -> (BulkGraphWriter, Arc<DeadLetterLog>, Arc<PipelineMetrics>) {
        let dead_letters = Arc::new(DeadLetterLog::new(dir.path().join("dead.jsonl")));
        let metrics = Arc::new(PipelineMetrics::new());
        let retry = RetryPolicy::table(
            max_retries,
            DEFAULT_RETRY_DELAYS_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        );
        let writer = BulkGraphWriter::new(
            store,
            batch_size,
            retry,
            dead_letters.clone(),
            metrics.clone(),
        );
        (writer, dead_letters, metrics)
    }

    #[test]
    fn test_degradation_schedule() {
        assert_eq!(degradation_sizes(100), vec![50, 10, 1]);
        assert_eq!(degradation_sizes(101), vec![50, 10, 1]);
        assert_eq!(degradation_sizes(15), vec![7, 1]);
        assert_eq!(degradation_sizes(2), vec![1]);
        assert!(degradation_sizes(1).is_empty());
    }

    #[test]
    fn test_table_delays_clamp_to_last_entry() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..8).map(|a| policy.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16, 16, 16]);
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_splits_into_sub_batches() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (writer, _, _) = writer(store.clone(), 500, 5, &dir);

        let written = writer.write_entities(&entities(1200)).await.unwrap();
        assert_eq!(written, 1200);
        assert_eq!(*store.calls.lock().unwrap(), vec![500, 500, 200]);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (writer, _, _) = writer(store.clone(), 10, 5, &dir);
        assert_eq!(writer.write_entities(&[]).await.unwrap(), 0);
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_with_schedule() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::flaky(2));
        let (writer, dead_letters, metrics) = writer(store.clone(), 100, 5, &dir);

        let start = tokio::time::Instant::now();
        let written = writer.write_entities(&entities(10)).await.unwrap();

        assert_eq!(written, 10);
        // 1s after the first failure, 2s after the second.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
        assert_eq!(metrics.write_retries.load(Ordering::Relaxed), 2);
        assert!(dead_letters.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_malformed_record_among_hundred() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (writer, dead_letters, metrics) = writer(store.clone(), 500, 5, &dir);

        let mut batch = entities(99);
        batch.insert(37, Entity::new("bad:record", "Table"));
        assert_eq!(batch.len(), 100);

        let written = writer.write_entities(&batch).await.unwrap();
        assert_eq!(written, 99);
        assert_eq!(store.entity_ids().len(), 99);
        assert!(!store.entity_ids().contains(&"bad:record".to_string()));

        let records = dead_letters.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, "write_entities");
        assert_eq!(records[0].item["id"], "bad:record");
        assert_eq!(metrics.dead_lettered.load(Ordering::Relaxed), 1);
        // Malformed records are never retried.
        assert_eq!(metrics.write_retries.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_every_valid_record_lands_around_a_malformed_one() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (writer, dead_letters, _) = writer(store.clone(), 40, 5, &dir);

        let mut batch = entities(100);
        batch.push(Entity::new("bad:tail", "Table"));

        assert_eq!(writer.write_entities(&batch).await.unwrap(), 100);
        assert_eq!(dead_letters.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_progress_propagates_original_error() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (writer, dead_letters, _) = writer(store, 500, 5, &dir);

        let batch = vec![Entity::new("bad:1", "Table"), Entity::new("bad:2", "Table")];
        let err = writer.write_entities(&batch).await.unwrap_err();

        let WriteError::Exhausted { failed, source } = err;
        assert_eq!(failed, 2);
        // The top-level attempt saw the first bad record.
        assert!(source.to_string().contains("bad:1"));
        // Records were still dead-lettered before the error surfaced.
        assert_eq!(dead_letters.read_all().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_transient_failure_dead_letters_everything() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore {
            always_transient: true,
            ..FakeStore::default()
        });
        let (writer, dead_letters, _) = writer(store.clone(), 4, 1, &dir);

        let result = writer.write_entities(&entities(4)).await;
        assert!(matches!(result, Err(WriteError::Exhausted { failed: 4, .. })));
        assert_eq!(dead_letters.read_all().await.unwrap().len(), 4);
        // 4 → 2 → 1: one sub-batch, two halves, four singles, two attempts each.
        assert_eq!(store.calls.lock().unwrap().len(), (1 + 2 + 4) * 2);
    }

    #[tokio::test]
    async fn test_relationships_use_their_own_stage() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FakeStore::default());
        let (writer, _, metrics) = writer(store.clone(), 2, 0, &dir);

        let rels: Vec<Relationship> = (0..5)
            .map(|i| Relationship::new("file:a.sql", "DEFINES", format!("table:{}", i)))
            .collect();
        assert_eq!(writer.write_relationships(&rels).await.unwrap(), 5);
        assert_eq!(store.relationships.lock().unwrap().len(), 5);
        assert_eq!(metrics.batch_size.count(), 3);
        assert_eq!(Relationship::STAGE, "write_relationships");
    }
}
