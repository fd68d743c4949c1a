//! Metrics collection for engine monitoring.

use hdrhistogram::Histogram;
use parking_lot::RwLock;

use super::MetricsSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Engine metrics collector
#[derive(Debug)]
pub struct Metrics {
    // Task counters
    tasks_submitted: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_timed_out: AtomicU64,
    tasks_cancelled: AtomicU64,

    // Scatter/gather counters
    items_mapped: AtomicU64,
    items_failed: AtomicU64,

    // Execution time per attempt, nanoseconds
    latency_histogram: RwLock<Histogram<u64>>,

    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        // 3 significant figures, auto-resizing so long tasks never overflow
        let histogram = Histogram::new(3).expect("Failed to create histogram");

        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_succeeded: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            tasks_timed_out: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            items_mapped: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            latency_histogram: RwLock::new(histogram),
            start_time: Instant::now(),
        }
    }

    pub fn record_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished attempt and how long it ran
    pub fn record_attempt(&self, duration: Duration) {
        if let Some(mut hist) = self.latency_histogram.try_write() {
            let _ = hist.record(duration.as_nanos() as u64);
        }
    }

    pub fn record_success(&self) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.tasks_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mapped(&self, items: usize, failed: usize) {
        self.items_mapped.fetch_add(items as u64, Ordering::Relaxed);
        self.items_failed.fetch_add(failed as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let histogram = self.latency_histogram.read();

        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_timed_out: self.tasks_timed_out.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            items_mapped: self.items_mapped.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            attempts: histogram.len(),
            avg_latency_ns: if histogram.len() > 0 {
                histogram.mean() as u64
            } else {
                0
            },
            p50_latency_ns: histogram.value_at_quantile(0.50),
            p95_latency_ns: histogram.value_at_quantile(0.95),
            p99_latency_ns: histogram.value_at_quantile(0.99),
            max_latency_ns: histogram.max(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.tasks_submitted,
            &self.tasks_succeeded,
            &self.tasks_failed,
            &self.tasks_retried,
            &self.tasks_timed_out,
            &self.tasks_cancelled,
            &self.items_mapped,
            &self.items_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }

        if let Some(mut hist) = self.latency_histogram.try_write() {
            hist.reset();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_basic() {
        let metrics = Metrics::new();

        metrics.record_submitted();
        metrics.record_attempt(Duration::from_micros(1));
        metrics.record_attempt(Duration::from_micros(2));
        metrics.record_retry();
        metrics.record_success();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_submitted, 1);
        assert_eq!(snapshot.tasks_retried, 1);
        assert_eq!(snapshot.tasks_succeeded, 1);
        assert_eq!(snapshot.attempts, 2);
        assert!(snapshot.avg_latency_ns > 0);
    }

    #[test]
    fn test_long_attempts_recorded() {
        let metrics = Metrics::new();
        metrics.record_attempt(Duration::from_secs(7200));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.attempts, 1);
        assert!(snapshot.max_latency_ns >= 7_000_000_000_000);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = Metrics::new();

        metrics.record_failure();
        metrics.record_attempt(Duration::from_millis(1));
        assert_eq!(metrics.snapshot().tasks_failed, 1);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_failed, 0);
        assert_eq!(snapshot.attempts, 0);
    }

    #[test]
    fn test_success_rate() {
        let mut snapshot = MetricsSnapshot {
            tasks_succeeded: 3,
            tasks_failed: 1,
            ..Default::default()
        };

        assert_eq!(snapshot.success_rate(), 0.75);

        snapshot.tasks_failed = 3;
        assert_eq!(snapshot.success_rate(), 0.5);
    }
}
