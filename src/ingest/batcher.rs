//! Deduplicating, debouncing event batcher.
//!
//! Keys (usually file paths) collect in a pending set. The set is handed to a
//! [`BatchHandler`] when no new key has arrived for the debounce window, or
//! immediately once it reaches the size threshold. A key is never pending twice.
//! Background flushes go through one dispatcher task, so the handler sees
//! batches one at a time and in the order they were cut.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BatcherConfig;
use crate::metrics::PipelineMetrics;

/// Receives every flushed batch. Typically submits each key to the worker pool.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, keys: Vec<String>) -> anyhow::Result<()>;
}

struct PendingEvent {
    key: String,
    first_seen: Instant,
}

type Outbox = mpsc::UnboundedSender<(Vec<PendingEvent>, Trigger)>;

struct Pending {
    events: Vec<PendingEvent>,
    keys: HashSet<String>,
    /// When the debounce timer should fire; pushed back by every new key.
    deadline: Option<Instant>,
    /// Queue to the dispatcher task; `None` once the batcher is shut down.
    outbox: Option<Outbox>,
}

impl Pending {
    fn take(&mut self) -> Vec<PendingEvent> {
        self.keys.clear();
        self.deadline = None;
        std::mem::take(&mut self.events)
    }

    /// Queue a batch for the dispatcher. Called under the pending lock so the
    /// queue order matches the order batches were taken.
    fn enqueue(&self, events: Vec<PendingEvent>, trigger: Trigger) {
        if events.is_empty() {
            return;
        }
        match &self.outbox {
            Some(outbox) => {
                if outbox.send((events, trigger)).is_err() {
                    tracing::error!(?trigger, "Batch dispatcher is gone, dropping batch");
                }
            }
            None => tracing::warn!(?trigger, "Batcher is shut down, dropping batch"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Manual,
    Threshold,
    Timer,
    Unbatched,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatcherStats {
    pub pending: usize,
    pub events_received: u64,
    pub events_deduplicated: u64,
    pub flushes: u64,
    pub threshold_flushes: u64,
    pub timer_flushes: u64,
    pub keys_flushed: u64,
    pub flush_errors: u64,
}

struct Inner {
    enabled: bool,
    debounce: Duration,
    threshold: usize,
    pending: Mutex<Pending>,
    handler: Arc<dyn BatchHandler>,
    wake: Notify,
    cancel: CancellationToken,
    received: AtomicU64,
    deduplicated: AtomicU64,
    flushes: AtomicU64,
    threshold_flushes: AtomicU64,
    timer_flushes: AtomicU64,
    keys_flushed: AtomicU64,
    flush_errors: AtomicU64,
    metrics: Arc<PipelineMetrics>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn dispatch(&self, events: Vec<PendingEvent>, trigger: Trigger) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let oldest = events.iter().map(|e| e.first_seen).min();
        let keys: Vec<String> = events.into_iter().map(|e| e.key).collect();
        let n = keys.len();

        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.keys_flushed.fetch_add(n as u64, Ordering::Relaxed);
        match trigger {
            Trigger::Threshold => {
                self.threshold_flushes.fetch_add(1, Ordering::Relaxed);
            }
            Trigger::Timer => {
                self.timer_flushes.fetch_add(1, Ordering::Relaxed);
            }
            Trigger::Manual | Trigger::Unbatched => {}
        }
        PipelineMetrics::incr(&self.metrics.batches_flushed);

        tracing::debug!(
            ?trigger,
            "Flushing {} keys (oldest pending {:?})",
            n,
            oldest.map(|t| t.elapsed()).unwrap_or_default()
        );

        if let Err(e) = self.handler.handle_batch(keys).await {
            self.flush_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        Ok(())
    }
}

/// Runs queued flushes one after another; errors are logged, never raised.
async fn dispatch_loop(
    inner: Arc<Inner>,
    mut queue: mpsc::UnboundedReceiver<(Vec<PendingEvent>, Trigger)>,
) {
    while let Some((events, trigger)) = queue.recv().await {
        if let Err(e) = inner.dispatch(events, trigger).await {
            tracing::error!(?trigger, "Batch callback failed: {:#}", e);
        }
    }
    tracing::debug!("Batch dispatcher stopped");
}

async fn debounce_loop(inner: Arc<Inner>) {
    loop {
        let deadline = inner.lock().deadline;
        match deadline {
            None => {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = inner.wake.notified() => {}
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = inner.wake.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        let mut pending = inner.lock();
                        if matches!(pending.deadline, Some(d) if d <= Instant::now()) {
                            let events = pending.take();
                            pending.enqueue(events, Trigger::Timer);
                        }
                    }
                }
            }
        }
    }
    tracing::debug!("Batcher timer stopped");
}

pub struct Batcher {
    inner: Arc<Inner>,
    timer: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Batcher {
    /// Create the batcher and start its dispatcher and debounce timer on the
    /// current runtime.
    pub fn new(
        config: &BatcherConfig,
        handler: Arc<dyn BatchHandler>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (outbox, queue) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            enabled: config.enabled,
            debounce: config.debounce_window(),
            threshold: config.batch_size_threshold,
            pending: Mutex::new(Pending {
                events: Vec::new(),
                keys: HashSet::new(),
                deadline: None,
                outbox: Some(outbox),
            }),
            handler,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            received: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            threshold_flushes: AtomicU64::new(0),
            timer_flushes: AtomicU64::new(0),
            keys_flushed: AtomicU64::new(0),
            flush_errors: AtomicU64::new(0),
            metrics,
        });

        let dispatcher = tokio::spawn(dispatch_loop(inner.clone(), queue));
        let timer = inner
            .enabled
            .then(|| tokio::spawn(debounce_loop(inner.clone())));

        Self {
            inner,
            timer: Mutex::new(timer),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Record an event for `key`. Never blocks; flushes run in the background.
    pub fn add_event(&self, key: impl Into<String>) {
        let key = key.into();
        let inner = &self.inner;
        inner.received.fetch_add(1, Ordering::Relaxed);
        PipelineMetrics::incr(&inner.metrics.events_received);

        let mut pending = inner.lock();
        if pending.outbox.is_none() {
            tracing::warn!("Batcher is shut down, ignoring event for {}", key);
            return;
        }

        if !inner.enabled {
            pending.enqueue(
                vec![PendingEvent {
                    key,
                    first_seen: Instant::now(),
                }],
                Trigger::Unbatched,
            );
            return;
        }

        if pending.keys.contains(&key) {
            inner.deduplicated.fetch_add(1, Ordering::Relaxed);
            PipelineMetrics::incr(&inner.metrics.events_deduplicated);
            tracing::trace!("Deduplicated event for {}", key);
            return;
        }

        let now = Instant::now();
        pending.keys.insert(key.clone());
        pending.events.push(PendingEvent {
            key,
            first_seen: now,
        });
        pending.deadline = Some(now + inner.debounce);

        if inner.threshold > 0 && pending.events.len() >= inner.threshold {
            let events = pending.take();
            pending.enqueue(events, Trigger::Threshold);
        }
        drop(pending);
        inner.wake.notify_one();
    }

    /// Hand the whole pending set to the handler now. Returns the number of
    /// keys flushed; handler errors propagate, and the keys are not re-queued.
    /// Runs on the caller's task, not behind batches already queued for the
    /// dispatcher.
    pub async fn flush_now(&self) -> anyhow::Result<usize> {
        let events = self.inner.lock().take();
        let n = events.len();
        self.inner.dispatch(events, Trigger::Manual).await?;
        Ok(n)
    }

    /// Stop the timer, let queued flushes finish in order, then flush what is
    /// still pending. Later events are ignored.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let events = {
            let mut pending = self.inner.lock();
            // Dropping the sender lets the dispatcher drain and exit.
            if pending.outbox.take().is_none() {
                return Ok(());
            }
            pending.take()
        };

        self.inner.cancel.cancel();
        for (name, slot) in [("timer", &self.timer), ("dispatcher", &self.dispatcher)] {
            let handle = slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    tracing::error!("Batcher {} join error: {}", name, e);
                }
            }
        }

        let result = self.inner.dispatch(events, Trigger::Manual).await;
        tracing::info!("Batcher shut down");
        result
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn stats(&self) -> BatcherStats {
        let i = &self.inner;
        BatcherStats {
            pending: self.pending_len(),
            events_received: i.received.load(Ordering::Relaxed),
            events_deduplicated: i.deduplicated.load(Ordering::Relaxed),
            flushes: i.flushes.load(Ordering::Relaxed),
            threshold_flushes: i.threshold_flushes.load(Ordering::Relaxed),
            timer_flushes: i.timer_flushes.load(Ordering::Relaxed),
            keys_flushed: i.keys_flushed.load(Ordering::Relaxed),
            flush_errors: i.flush_errors.load(Ordering::Relaxed),
        }
    }
}
