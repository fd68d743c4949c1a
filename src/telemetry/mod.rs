//! Telemetry and observability subsystem.
//!
//! Provides metrics collection and export of engine statistics for
//! monitoring integrations.

use serde::Serialize;

pub mod export;

#[cfg(feature = "telemetry")]
pub mod metrics;

pub use export::{JsonExporter, LogExporter, StatsExporter};

#[cfg(feature = "telemetry")]
pub use metrics::Metrics;

#[cfg(not(feature = "telemetry"))]
pub use self::stub::Metrics;

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub tasks_submitted: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_timed_out: u64,
    pub tasks_cancelled: u64,
    pub items_mapped: u64,
    pub items_failed: u64,
    pub attempts: u64,
    pub avg_latency_ns: u64,
    pub p50_latency_ns: u64,
    pub p95_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    /// Fraction of finished tasks that succeeded (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        let finished = self.tasks_succeeded + self.tasks_failed;
        if finished == 0 {
            return 0.0;
        }
        self.tasks_succeeded as f64 / finished as f64
    }

    /// Calculate finished tasks per second
    pub fn tasks_per_second(&self) -> f64 {
        if self.uptime_secs == 0.0 {
            return 0.0;
        }
        (self.tasks_succeeded + self.tasks_failed) as f64 / self.uptime_secs
    }
}

// Stub implementation when telemetry is disabled
#[cfg(not(feature = "telemetry"))]
mod stub {
    use super::MetricsSnapshot;
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    pub struct Metrics;

    impl Metrics {
        pub fn new() -> Self { Self }
        pub fn record_submitted(&self) {}
        pub fn record_attempt(&self, _: Duration) {}
        pub fn record_success(&self) {}
        pub fn record_failure(&self) {}
        pub fn record_retry(&self) {}
        pub fn record_timeout(&self) {}
        pub fn record_cancelled(&self) {}
        pub fn record_mapped(&self, _: usize, _: usize) {}
        pub fn snapshot(&self) -> MetricsSnapshot { MetricsSnapshot::default() }
        pub fn reset(&self) {}
    }
}
