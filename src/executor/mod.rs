//! Task execution infrastructure.
//!
//! This module provides the task records, the registry of named task
//! functions, the dedicated priority-queue workers and the work-stealing
//! pools behind the scatter/gather helpers.

pub mod cpu_pool;
pub mod function;
pub mod panic_handler;
pub mod task;
pub mod worker;

pub use cpu_pool::{CpuPool, PoolOptions};
pub use function::{FunctionRegistry, TaskFn, TaskOutcome};
pub use panic_handler::{PanicHandler, PanicInfo, PanicStrategy};
pub use task::{SubmitOptions, Task, TaskArgs, TaskId, TaskStatus};
pub use worker::{WorkerStats, WorkerStatus};

pub(crate) use worker::{Worker, WorkerContext};
