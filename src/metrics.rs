//! Lock-free pipeline metrics with Prometheus text exposition.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0];
const WRITE_DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0];

/// Cumulative histogram with fixed upper bounds.
pub struct Histogram {
    bounds: &'static [f64],
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    /// Sum in millionths of the observed unit
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            counts: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        for (bound, slot) in self.bounds.iter().zip(&self.counts) {
            if value <= *bound {
                slot.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for (bound, slot) in self.bounds.iter().zip(&self.counts) {
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                name,
                bound,
                slot.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, self.count());
        let _ = writeln!(out, "{}_sum {}", name, self.sum());
        let _ = writeln!(out, "{}_count {}", name, self.count());
    }
}

/// Counters, gauges and histograms shared by every pipeline component.
pub struct PipelineMetrics {
    pub events_received: AtomicU64,
    pub events_deduplicated: AtomicU64,
    pub batches_flushed: AtomicU64,

    pub tasks_processed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_timed_out: AtomicU64,
    pub tasks_cancelled: AtomicU64,

    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,

    pub records_written: AtomicU64,
    pub write_retries: AtomicU64,
    pub write_degradations: AtomicU64,
    pub dead_lettered: AtomicU64,

    pub queue_depth: AtomicUsize,
    pub active_workers: AtomicUsize,

    pub batch_size: Histogram,
    pub write_duration: Histogram,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_deduplicated: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            tasks_processed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_timed_out: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
            write_degradations: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            active_workers: AtomicUsize::new(0),
            batch_size: Histogram::new(BATCH_SIZE_BUCKETS),
            write_duration: Histogram::new(WRITE_DURATION_BUCKETS),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_write(&self, batch_len: usize, elapsed: Duration) {
        self.batch_size.observe(batch_len as f64);
        self.write_duration.observe(elapsed.as_secs_f64());
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        serde_json::json!({
            "events_received": load(&self.events_received),
            "events_deduplicated": load(&self.events_deduplicated),
            "batches_flushed": load(&self.batches_flushed),
            "tasks_processed": load(&self.tasks_processed),
            "tasks_failed": load(&self.tasks_failed),
            "tasks_timed_out": load(&self.tasks_timed_out),
            "tasks_cancelled": load(&self.tasks_cancelled),
            "cache_hits": load(&self.cache_hits),
            "cache_misses": load(&self.cache_misses),
            "records_written": load(&self.records_written),
            "write_retries": load(&self.write_retries),
            "write_degradations": load(&self.write_degradations),
            "dead_lettered": load(&self.dead_lettered),
            "queue_depth": self.queue_depth.load(Ordering::Relaxed),
            "active_workers": self.active_workers.load(Ordering::Relaxed),
            "write_batches": self.batch_size.count(),
        })
    }

    /// Export metrics in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);
        let counters: [(&str, &str, &AtomicU64); 13] = [
            ("graphingest_events_received_total", "Events offered to the batcher.", &self.events_received),
            ("graphingest_events_deduplicated_total", "Events collapsed into an already pending key.", &self.events_deduplicated),
            ("graphingest_batches_flushed_total", "Batches emitted by the batcher.", &self.batches_flushed),
            ("graphingest_tasks_processed_total", "Worker tasks that completed successfully.", &self.tasks_processed),
            ("graphingest_tasks_failed_total", "Worker tasks that returned an error, panicked or timed out.", &self.tasks_failed),
            ("graphingest_tasks_timed_out_total", "Worker tasks that exceeded their deadline.", &self.tasks_timed_out),
            ("graphingest_tasks_cancelled_total", "Worker tasks dropped by a non-draining shutdown.", &self.tasks_cancelled),
            ("graphingest_cache_hits_total", "Parse cache hits.", &self.cache_hits),
            ("graphingest_cache_misses_total", "Parse cache misses.", &self.cache_misses),
            ("graphingest_records_written_total", "Graph records written.", &self.records_written),
            ("graphingest_write_retries_total", "Retried sub-batch writes.", &self.write_retries),
            ("graphingest_write_degradations_total", "Sub-batches re-split after exhausting retries.", &self.write_degradations),
            ("graphingest_dead_lettered_total", "Records appended to the dead-letter log.", &self.dead_lettered),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value.load(Ordering::Relaxed));
        }

        let gauges: [(&str, &str, &AtomicUsize); 2] = [
            ("graphingest_queue_depth", "Work items waiting in the priority queue.", &self.queue_depth),
            ("graphingest_active_workers", "Workers currently executing a task.", &self.active_workers),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value.load(Ordering::Relaxed));
        }

        self.batch_size.render(
            &mut out,
            "graphingest_write_batch_size",
            "Records per store write call.",
        );
        self.write_duration.render(
            &mut out,
            "graphingest_write_duration_seconds",
            "Duration of store write calls.",
        );
        out
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let h = Histogram::new(BATCH_SIZE_BUCKETS);
        h.observe(3.0);
        h.observe(70.0);
        let mut out = String::new();
        h.render(&mut out, "x", "test");
        assert!(out.contains("x_bucket{le=\"1\"} 0"));
        assert!(out.contains("x_bucket{le=\"5\"} 1"));
        assert!(out.contains("x_bucket{le=\"100\"} 2"));
        assert!(out.contains("x_bucket{le=\"+Inf\"} 2"));
        assert_eq!(h.count(), 2);
        assert!((h.sum() - 73.0).abs() < 1e-6);
    }

    #[test]
    fn test_prometheus_exposition() {
        let metrics = PipelineMetrics::new();
        PipelineMetrics::incr(&metrics.cache_hits);
        PipelineMetrics::add(&metrics.records_written, 42);
        metrics.queue_depth.store(7, Ordering::Relaxed);
        metrics.record_write(42, Duration::from_millis(20));

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE graphingest_cache_hits_total counter"));
        assert!(text.contains("graphingest_cache_hits_total 1\n"));
        assert!(text.contains("graphingest_records_written_total 42\n"));
        assert!(text.contains("graphingest_queue_depth 7\n"));
        assert!(text.contains("graphingest_write_duration_seconds_count 1\n"));
    }

    #[test]
    fn test_snapshot_json() {
        let metrics = PipelineMetrics::new();
        PipelineMetrics::incr(&metrics.tasks_failed);
        let snap = metrics.snapshot();
        assert_eq!(snap["tasks_failed"], 1);
        assert_eq!(snap["write_batches"], 0);
    }
}
