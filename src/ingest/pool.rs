//! Fixed-size worker pool draining one shared priority queue.
//!
//! Items are served by priority, then by submission order. Producers are
//! stalled (never rejected) under queue or memory pressure. A failing,
//! panicking or timed-out task is counted and logged; the worker moves on.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::metrics::PipelineMetrics;
use crate::models::Priority;
use crate::resource_limits::{ResourceLimits, SlotGuard};

pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

/// One queued unit of work, consumed exactly once.
pub struct WorkItem {
    pub priority: Priority,
    /// Submission order; breaks ties within a priority level (FIFO).
    pub seq: u64,
    pub key: String,
    pub enqueued_at: Instant,
    task: TaskFuture,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    // BinaryHeap pops the greatest element: invert so the lowest
    // (priority, seq) pair comes out first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolState {
    NotStarted,
    Running,
    Draining,
    Stopped,
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Draining => "DRAINING",
            Self::Stopped => "STOPPED",
        }
    }

    fn accepts_work(&self) -> bool {
        matches!(self, Self::NotStarted | Self::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub state: PoolState,
    pub workers: usize,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub submitted: u64,
    pub processed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

struct Inner {
    state: PoolState,
    queue: BinaryHeap<WorkItem>,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    cancel: CancellationToken,
    seq: AtomicU64,
    queue_len: AtomicUsize,
    active: Arc<AtomicUsize>,
    task_timeout: Option<Duration>,
    submitted: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    metrics: Arc<PipelineMetrics>,
}

enum Next {
    Run(WorkItem),
    Wait,
    Exit,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sync_gauges(&self, queue_len: usize) {
        self.queue_len.store(queue_len, Ordering::SeqCst);
        self.metrics.queue_depth.store(queue_len, Ordering::Relaxed);
        self.metrics
            .active_workers
            .store(self.active.load(Ordering::SeqCst), Ordering::Relaxed);
    }

    fn next_item(&self) -> Next {
        let mut inner = self.lock();
        let state = inner.state;
        match inner.queue.pop() {
            Some(item) => {
                let len = inner.queue.len();
                drop(inner);
                self.sync_gauges(len);
                Next::Run(item)
            }
            None if state == PoolState::Running => Next::Wait,
            None => Next::Exit,
        }
    }

    /// Drop every queued item, counting each as cancelled.
    fn discard_queue(&self) -> usize {
        let discarded: Vec<WorkItem> = {
            let mut inner = self.lock();
            inner.queue.drain().collect()
        };
        let n = discarded.len();
        if n > 0 {
            self.cancelled.fetch_add(n as u64, Ordering::Relaxed);
            PipelineMetrics::add(&self.metrics.tasks_cancelled, n as u64);
        }
        self.sync_gauges(0);
        n
    }

    async fn run_item(&self, worker_id: usize, item: WorkItem) {
        let WorkItem {
            key,
            priority,
            enqueued_at,
            task,
            ..
        } = item;
        tracing::debug!(
            worker = worker_id,
            %priority,
            "Running {} (queued {:?})",
            key,
            enqueued_at.elapsed()
        );

        let slot = SlotGuard::acquire(&self.active);
        self.sync_gauges(self.queue_len.load(Ordering::SeqCst));

        let guarded = AssertUnwindSafe(task).catch_unwind();
        let deadline = self.task_timeout;
        let run = async move {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, guarded).await.ok(),
                None => Some(guarded.await),
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            outcome = run => Some(outcome),
        };

        match outcome {
            None => {
                tracing::warn!(worker = worker_id, "Cancelled in-flight task {}", key);
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                PipelineMetrics::incr(&self.metrics.tasks_cancelled);
            }
            Some(Some(Ok(Ok(())))) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                PipelineMetrics::incr(&self.metrics.tasks_processed);
            }
            Some(Some(Ok(Err(e)))) => {
                tracing::error!(worker = worker_id, "Task {} failed: {:#}", key, e);
                self.failed.fetch_add(1, Ordering::Relaxed);
                PipelineMetrics::incr(&self.metrics.tasks_failed);
            }
            Some(Some(Err(_panic))) => {
                tracing::error!(worker = worker_id, "Task {} panicked", key);
                self.failed.fetch_add(1, Ordering::Relaxed);
                PipelineMetrics::incr(&self.metrics.tasks_failed);
            }
            Some(None) => {
                tracing::error!(
                    worker = worker_id,
                    "Task {} exceeded its {:?} deadline",
                    key,
                    deadline.unwrap_or_default()
                );
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                PipelineMetrics::incr(&self.metrics.tasks_failed);
                PipelineMetrics::incr(&self.metrics.tasks_timed_out);
            }
        }

        drop(slot);
        self.sync_gauges(self.queue_len.load(Ordering::SeqCst));
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        // Register before inspecting the queue so a wakeup cannot slip in between.
        notified.as_mut().enable();

        match shared.next_item() {
            Next::Run(item) => shared.run_item(worker_id, item).await,
            Next::Exit => break,
            Next::Wait => {
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = &mut notified => {}
                }
            }
        }

        if shared.cancel.is_cancelled() {
            break;
        }
    }
    tracing::debug!(worker = worker_id, "Worker exited");
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: usize,
    limits: ResourceLimits,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        limits: ResourceLimits,
        task_timeout: Option<Duration>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: PoolState::NotStarted,
                    queue: BinaryHeap::new(),
                }),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
                seq: AtomicU64::new(0),
                queue_len: AtomicUsize::new(0),
                active: Arc::new(AtomicUsize::new(0)),
                task_timeout,
                submitted: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                metrics,
            }),
            workers: workers.max(1),
            limits,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(
        config: &PoolConfig,
        limits: ResourceLimits,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self::new(config.worker_count(), limits, config.task_timeout(), metrics)
    }

    pub fn state(&self) -> PoolState {
        self.shared.lock().state
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue_len.load(Ordering::SeqCst)
    }

    /// Spawn the workers. Items submitted before this call are kept.
    pub fn start(&self) -> Result<(), PoolError> {
        {
            let mut inner = self.shared.lock();
            if inner.state != PoolState::NotStarted {
                return Err(PoolError::AlreadyStarted);
            }
            inner.state = PoolState::Running;
        }

        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        for worker_id in 0..self.workers {
            let shared = self.shared.clone();
            handles.push(tokio::spawn(worker_loop(shared, worker_id)));
        }
        tracing::info!("Worker pool started with {} workers", self.workers);
        Ok(())
    }

    /// Enqueue `task` under `key`. Stalls while the pool is saturated.
    pub async fn submit<F>(
        &self,
        key: impl Into<String>,
        task: F,
        priority: Priority,
    ) -> Result<(), PoolError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = key.into();
        self.ensure_accepting()?;

        let shared = &self.shared;
        self.limits
            .wait_for_capacity(|| shared.queue_len.load(Ordering::SeqCst))
            .await;

        let len = {
            let mut inner = self.shared.lock();
            if !inner.state.accepts_work() {
                return Err(PoolError::NotRunning(inner.state.as_str()));
            }
            inner.queue.push(WorkItem {
                priority,
                seq: self.shared.seq.fetch_add(1, Ordering::SeqCst),
                key,
                enqueued_at: Instant::now(),
                task: task.boxed(),
            });
            inner.queue.len()
        };

        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        self.shared.sync_gauges(len);
        self.shared.notify.notify_one();
        Ok(())
    }

    fn ensure_accepting(&self) -> Result<(), PoolError> {
        let state = self.state();
        if state.accepts_work() {
            Ok(())
        } else {
            Err(PoolError::NotRunning(state.as_str()))
        }
    }

    /// Stop the pool. With `wait_for_completion` the queue and in-flight tasks
    /// finish first; otherwise both are cancelled immediately.
    pub async fn shutdown(&self, wait_for_completion: bool) {
        let previous = {
            let mut inner = self.shared.lock();
            let previous = inner.state;
            if matches!(previous, PoolState::Draining | PoolState::Stopped) {
                return;
            }
            inner.state = PoolState::Draining;
            previous
        };
        tracing::info!(
            "Worker pool draining (wait_for_completion={}, queued={})",
            wait_for_completion,
            self.queue_len()
        );

        if !wait_for_completion || previous == PoolState::NotStarted {
            let discarded = self.shared.discard_queue();
            if discarded > 0 {
                tracing::warn!("Worker pool discarded {} queued tasks", discarded);
            }
        }
        if !wait_for_completion {
            self.shared.cancel.cancel();
        }
        self.shared.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker task join error: {}", e);
            }
        }

        self.shared.lock().state = PoolState::Stopped;
        self.shared.sync_gauges(0);
        let stats = self.stats();
        tracing::info!(
            "Worker pool stopped: {} processed, {} failed, {} cancelled",
            stats.processed,
            stats.failed,
            stats.cancelled
        );
    }

    pub fn stats(&self) -> PoolStats {
        let (state, queue_depth) = {
            let inner = self.shared.lock();
            (inner.state, inner.queue.len())
        };
        PoolStats {
            state,
            workers: self.workers,
            queue_depth,
            active_workers: self.shared.active.load(Ordering::SeqCst),
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            processed: self.shared.processed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            timed_out: self.shared.timed_out.load(Ordering::Relaxed),
            cancelled: self.shared.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_limits::tests::FakeMemoryProbe;
    use tokio::sync::oneshot;

    fn pool(workers: usize) -> WorkerPool {
        WorkerPool::new(
            workers,
            ResourceLimits::new(
                0,
                90.0,
                Duration::from_millis(2),
                Arc::new(FakeMemoryProbe::new(10.0)),
            ),
            None,
            Arc::new(PipelineMetrics::new()),
        )
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> impl Future<Output = anyhow::Result<()>> {
        let log = log.clone();
        let name = name.to_string();
        async move {
            log.lock().unwrap().push(name);
            Ok(())
        }
    }

    #[test]
    fn test_work_item_ordering() {
        let item = |priority, seq| WorkItem {
            priority,
            seq,
            key: String::new(),
            enqueued_at: Instant::now(),
            task: async { Ok(()) }.boxed(),
        };
        let mut heap = BinaryHeap::new();
        heap.push(item(Priority::Batch, 0));
        heap.push(item(Priority::Normal, 1));
        heap.push(item(Priority::Critical, 2));
        heap.push(item(Priority::Normal, 3));
        heap.push(item(Priority::Critical, 4));

        let order: Vec<(Priority, u64)> =
            std::iter::from_fn(|| heap.pop().map(|i| (i.priority, i.seq))).collect();
        assert_eq!(
            order,
            vec![
                (Priority::Critical, 2),
                (Priority::Critical, 4),
                (Priority::Normal, 1),
                (Priority::Normal, 3),
                (Priority::Batch, 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_priority_order_on_single_idle_worker() {
        let pool = pool(1);
        pool.start().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        // Occupy the only worker so the next three items queue up together.
        let (release_tx, release_rx) = oneshot::channel::<()>();
        pool.submit(
            "gate",
            async move {
                let _ = release_rx.await;
                Ok(())
            },
            Priority::Critical,
        )
        .await
        .unwrap();
        while pool.stats().active_workers == 0 {
            tokio::task::yield_now().await;
        }

        pool.submit("b", recorder(&log, "batch"), Priority::Batch).await.unwrap();
        pool.submit("n", recorder(&log, "normal"), Priority::Normal).await.unwrap();
        pool.submit("c", recorder(&log, "critical"), Priority::Critical).await.unwrap();
        release_tx.send(()).unwrap();

        pool.shutdown(true).await;
        assert_eq!(*log.lock().unwrap(), vec!["critical", "normal", "batch"]);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let pool = pool(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            pool.submit(format!("k{}", i), recorder(&log, &i.to_string()), Priority::Normal)
                .await
                .unwrap();
        }
        pool.start().unwrap();
        pool.shutdown(true).await;

        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_failures_do_not_kill_workers() {
        let pool = pool(2);
        pool.start().unwrap();
        for i in 0..10 {
            let fail = i % 3 == 0;
            pool.submit(
                format!("k{}", i),
                async move {
                    if fail {
                        anyhow::bail!("parse failed");
                    }
                    Ok(())
                },
                Priority::Normal,
            )
            .await
            .unwrap();
        }
        fn explode() -> anyhow::Result<()> {
            panic!("bug in task")
        }
        pool.submit("boom", async { explode() }, Priority::Normal)
            .await
            .unwrap();
        pool.shutdown(true).await;

        let stats = pool.stats();
        assert_eq!(stats.state, PoolState::Stopped);
        assert_eq!(stats.submitted, 11);
        assert_eq!(stats.processed, 6);
        assert_eq!(stats.failed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_counts_as_failure() {
        let metrics = Arc::new(PipelineMetrics::new());
        let pool = WorkerPool::new(
            1,
            ResourceLimits::new(0, 90.0, Duration::from_millis(2), Arc::new(FakeMemoryProbe::new(0.0))),
            Some(Duration::from_secs(1)),
            metrics.clone(),
        );
        pool.start().unwrap();
        pool.submit(
            "hang",
            async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            },
            Priority::Normal,
        )
        .await
        .unwrap();
        pool.submit("after", async { Ok(()) }, Priority::Normal).await.unwrap();
        pool.shutdown(true).await;

        let stats = pool.stats();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(metrics.tasks_timed_out.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_wait_cancels_everything() {
        let pool = pool(1);
        pool.start().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let (started_tx, started_rx) = oneshot::channel::<()>();
        pool.submit(
            "stuck",
            async move {
                let _ = started_tx.send(());
                futures::future::pending::<()>().await;
                Ok(())
            },
            Priority::Normal,
        )
        .await
        .unwrap();
        started_rx.await.unwrap();

        for i in 0..5 {
            let ran = ran.clone();
            pool.submit(
                format!("k{}", i),
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Priority::Batch,
            )
            .await
            .unwrap();
        }

        pool.shutdown(false).await;
        let stats = pool.stats();
        assert_eq!(stats.state, PoolState::Stopped);
        assert_eq!(stats.cancelled, 6);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let pool = pool(1);
        pool.start().unwrap();
        pool.shutdown(true).await;
        let err = pool
            .submit("late", async { Ok(()) }, Priority::Normal)
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::NotRunning("STOPPED"));
        assert_eq!(pool.start().unwrap_err(), PoolError::AlreadyStarted);
    }

    #[tokio::test]
    async fn test_queue_backpressure_stalls_producer_without_dropping() {
        let pool = Arc::new(WorkerPool::new(
            1,
            ResourceLimits::new(4, 90.0, Duration::from_millis(1), Arc::new(FakeMemoryProbe::new(0.0))),
            None,
            Arc::new(PipelineMetrics::new()),
        ));
        let done = Arc::new(AtomicUsize::new(0));

        // Not started yet: the queue fills up to the limit.
        for i in 0..4 {
            let done = done.clone();
            pool.submit(
                format!("k{}", i),
                async move {
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Priority::Normal,
            )
            .await
            .unwrap();
        }

        let producer = {
            let pool = pool.clone();
            let done = done.clone();
            tokio::spawn(async move {
                pool.submit(
                    "k4",
                    async move {
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    Priority::Normal,
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(pool.queue_len(), 4);

        pool.start().unwrap();
        producer.await.unwrap().unwrap();
        pool.shutdown(true).await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_memory_backpressure_releases_below_hysteresis() {
        let probe = Arc::new(FakeMemoryProbe::new(95.0));
        let pool = Arc::new(WorkerPool::new(
            1,
            ResourceLimits::new(0, 90.0, Duration::from_millis(1), probe.clone()),
            None,
            Arc::new(PipelineMetrics::new()),
        ));
        pool.start().unwrap();

        let producer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit("k", async { Ok(()) }, Priority::Normal).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        probe.set(85.0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        probe.set(70.0);
        producer.await.unwrap().unwrap();
        pool.shutdown(true).await;
        assert_eq!(pool.stats().processed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_cancels_queue() {
        let pool = pool(2);
        pool.submit("k", async { Ok(()) }, Priority::Normal).await.unwrap();
        pool.shutdown(true).await;
        let stats = pool.stats();
        assert_eq!(stats.state, PoolState::Stopped);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.processed, 0);
    }
}
