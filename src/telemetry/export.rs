//! Engine statistics export for various sinks.

use crate::engine::EngineStats;
use crate::error::Result;
use std::path::PathBuf;

/// Trait for exporting engine statistics
pub trait StatsExporter: Send + Sync {
    /// Export a statistics snapshot
    fn export(&self, stats: &EngineStats) -> Result<()>;
}

/// Writes statistics to a file as pretty-printed JSON
#[derive(Debug, Clone)]
pub struct JsonExporter {
    output_path: PathBuf,
}

impl JsonExporter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.output_path
    }
}

impl StatsExporter for JsonExporter {
    fn export(&self, stats: &EngineStats) -> Result<()> {
        let json = serde_json::to_string_pretty(stats)?;
        std::fs::write(&self.output_path, json)?;
        tracing::debug!(path = %self.output_path.display(), "exported engine stats");
        Ok(())
    }
}

/// Emits statistics through `tracing` at info level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogExporter {
    verbose: bool,
}

impl LogExporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl StatsExporter for LogExporter {
    fn export(&self, stats: &EngineStats) -> Result<()> {
        let queue = &stats.queue;
        tracing::info!(
            running = stats.running,
            workers = stats.num_workers,
            pending = queue.pending,
            running_tasks = queue.running,
            succeeded = queue.success,
            failed = queue.failure,
            cancelled = queue.cancelled,
            queue_size = queue.queue_size,
            success_rate = stats.metrics.success_rate(),
            "engine stats"
        );

        if self.verbose {
            let metrics = &stats.metrics;
            tracing::info!(
                attempts = metrics.attempts,
                retried = metrics.tasks_retried,
                timed_out = metrics.tasks_timed_out,
                avg_us = metrics.avg_latency_ns as f64 / 1_000.0,
                p50_us = metrics.p50_latency_ns as f64 / 1_000.0,
                p95_us = metrics.p95_latency_ns as f64 / 1_000.0,
                p99_us = metrics.p99_latency_ns as f64 / 1_000.0,
                max_us = metrics.max_latency_ns as f64 / 1_000.0,
                "engine latency"
            );
            for worker in &stats.workers {
                tracing::info!(
                    worker = %worker.worker_id,
                    status = ?worker.status,
                    completed = worker.tasks_completed,
                    failed = worker.tasks_failed,
                    "worker stats"
                );
            }
        }

        Ok(())
    }
}
