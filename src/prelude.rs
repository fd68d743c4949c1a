pub use crate::config::{Config, ConfigBuilder, RetentionPolicy};
pub use crate::engine::{Engine, EngineStats, Stage};
pub use crate::error::{Error, Result, TaskError};
pub use crate::executor::{
    PanicStrategy, SubmitOptions, Task, TaskArgs, TaskId, TaskOutcome, TaskStatus, WorkerStats,
    WorkerStatus,
};
pub use crate::scheduler::QueueStats;
pub use crate::{global, init, init_with_config, shutdown};

pub use crate::telemetry::{JsonExporter, LogExporter, Metrics, MetricsSnapshot, StatsExporter};
