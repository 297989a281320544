//! Producer-side backpressure: queue length and system memory limits.
//!
//! Both checks stall the caller; nothing is ever rejected or dropped here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sysinfo::System;

/// Margin below the memory threshold that must be reached before producers resume.
pub const MEMORY_HYSTERESIS_PERCENT: f64 = 10.0;

/// Source of the current system memory utilization, 0.0..=100.0.
pub trait MemoryProbe: Send + Sync {
    fn used_percent(&self) -> f64;
}

/// Samples system memory through `sysinfo`. A host that reports no total
/// memory reads as 0%.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemoryProbe;

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn used_percent(&self) -> f64 {
        let mut sys = System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        sys.used_memory() as f64 / total as f64 * 100.0
    }
}

/// Limits applied on the submitting path of the worker pool.
#[derive(Clone)]
pub struct ResourceLimits {
    /// 0 disables the queue-length check
    pub max_queue_size: usize,
    pub memory_threshold_percent: f64,
    pub poll_interval: Duration,
    probe: Arc<dyn MemoryProbe>,
}

impl ResourceLimits {
    pub fn new(
        max_queue_size: usize,
        memory_threshold_percent: f64,
        poll_interval: Duration,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            max_queue_size,
            memory_threshold_percent,
            poll_interval,
            probe,
        }
    }

    /// No queue limit and a memory threshold that can never be reached.
    pub fn unbounded() -> Self {
        Self::new(0, f64::INFINITY, Duration::from_millis(10), Arc::new(SystemMemoryProbe::new()))
    }

    fn queue_saturated(&self, len: usize) -> bool {
        self.max_queue_size > 0 && len >= self.max_queue_size
    }

    fn queue_resume_level(&self) -> usize {
        self.max_queue_size / 2
    }

    fn memory_saturated(&self) -> bool {
        self.probe.used_percent() >= self.memory_threshold_percent
    }

    fn memory_recovered(&self) -> bool {
        self.probe.used_percent() < self.memory_threshold_percent - MEMORY_HYSTERESIS_PERCENT
    }

    /// Block until the queue has drained to half capacity and memory has fallen
    /// below the hysteresis margin. Returns how long the caller was stalled.
    pub async fn wait_for_capacity<F>(&self, queue_len: F) -> Duration
    where
        F: Fn() -> usize,
    {
        let start = Instant::now();

        let len = queue_len();
        if self.queue_saturated(len) {
            tracing::warn!(
                "Backpressure: queue full ({}/{}), waiting for it to drain to {}",
                len,
                self.max_queue_size,
                self.queue_resume_level()
            );
            while queue_len() > self.queue_resume_level() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        if self.memory_saturated() {
            tracing::warn!(
                "Backpressure: memory usage above {:.0}%, waiting for it to drop below {:.0}%",
                self.memory_threshold_percent,
                self.memory_threshold_percent - MEMORY_HYSTERESIS_PERCENT
            );
            while !self.memory_recovered() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        let stalled = start.elapsed();
        if stalled >= self.poll_interval {
            tracing::debug!("Backpressure released after {:?}", stalled);
        }
        stalled
    }
}

/// RAII guard that decrements a shared counter on drop.
pub struct SlotGuard {
    counter: Arc<AtomicUsize>,
}

impl SlotGuard {
    pub fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// Memory probe whose reading is set by the test.
    pub struct FakeMemoryProbe {
        percent_x100: AtomicU64,
    }

    impl FakeMemoryProbe {
        pub fn new(percent: f64) -> Self {
            Self {
                percent_x100: AtomicU64::new((percent * 100.0) as u64),
            }
        }

        pub fn set(&self, percent: f64) {
            self.percent_x100
                .store((percent * 100.0) as u64, Ordering::SeqCst);
        }
    }

    impl MemoryProbe for FakeMemoryProbe {
        fn used_percent(&self) -> f64 {
            self.percent_x100.load(Ordering::SeqCst) as f64 / 100.0
        }
    }

    #[tokio::test]
    async fn test_no_stall_below_limits() {
        let probe = Arc::new(FakeMemoryProbe::new(20.0));
        let limits = ResourceLimits::new(10, 90.0, Duration::from_millis(5), probe);
        let stalled = limits.wait_for_capacity(|| 3).await;
        assert!(stalled < Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_queue_stall_waits_for_half_capacity() {
        let probe = Arc::new(FakeMemoryProbe::new(0.0));
        let limits = ResourceLimits::new(10, 90.0, Duration::from_millis(2), probe);
        let len = Arc::new(AtomicUsize::new(10));

        let drain = len.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(3)).await;
                drain.fetch_sub(1, Ordering::SeqCst);
            }
        });

        let observed = len.clone();
        limits
            .wait_for_capacity(move || observed.load(Ordering::SeqCst))
            .await;
        assert!(len.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn test_memory_stall_uses_hysteresis() {
        let probe = Arc::new(FakeMemoryProbe::new(91.0));
        let limits = ResourceLimits::new(0, 90.0, Duration::from_millis(2), probe.clone());

        let setter = probe.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            // Below the threshold but inside the hysteresis band: still stalled.
            setter.set(85.0);
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set(79.0);
        });

        limits.wait_for_capacity(|| 0).await;
        assert!(probe.used_percent() < 80.0);
    }

    #[test]
    fn test_system_probe_reads_a_percentage() {
        let used = SystemMemoryProbe::new().used_percent();
        assert!((0.0..=100.0).contains(&used), "got {}", used);
    }

    #[test]
    fn test_slot_guard_releases_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _a = SlotGuard::acquire(&counter);
            let _b = SlotGuard::acquire(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
