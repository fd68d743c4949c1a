//! Dedicated priority-queue workers. Each one claims the next Pending task,
//! runs one attempt and writes the outcome back to the registry.

use super::function::{FunctionRegistry, TaskFn, TaskOutcome};
use super::panic_handler::PanicHandler;
use super::task::{Task, TaskArgs, TaskId, TaskStatus};
use crate::error::TaskError;
use crate::scheduler::TaskRegistry;
use crate::telemetry::Metrics;
use chrono::{DateTime, Utc};
use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stopped,
}

// stats for each worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub current_task: Option<TaskId>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub status: WorkerStatus,
}

impl WorkerStats {
    fn new(worker_id: String) -> Self {
        Self {
            worker_id,
            started_at: Utc::now(),
            tasks_completed: 0,
            tasks_failed: 0,
            current_task: None,
            last_heartbeat: None,
            status: WorkerStatus::Idle,
        }
    }
}

/// Everything a worker shares with the engine.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub registry: Arc<TaskRegistry>,
    pub functions: Arc<FunctionRegistry>,
    pub panic_handler: Arc<PanicHandler>,
    pub metrics: Arc<Metrics>,
    pub shutdown: Arc<AtomicBool>,
    pub poll_interval: Duration,
    pub error_pause: Duration,
    pub stack_size: Option<usize>,
}

pub(crate) struct Worker {
    pub id: String,
    pub stats: Arc<Mutex<WorkerStats>>,
    ctx: WorkerContext,
}

/// Resets the worker's stats however `process` is left. If `process`
/// unwinds before the outcome was written back, the claimed task is
/// failed here so it never stays Running.
struct ActiveTask<'a> {
    worker: &'a Worker,
    task_id: TaskId,
    settled: bool,
}

impl<'a> ActiveTask<'a> {
    fn enter(worker: &'a Worker, task_id: &TaskId) -> Self {
        {
            let mut stats = worker.stats.lock();
            stats.current_task = Some(task_id.clone());
            stats.status = WorkerStatus::Busy;
        }
        Self {
            worker,
            task_id: task_id.clone(),
            settled: false,
        }
    }

    fn settle(&mut self) {
        self.settled = true;
    }

    fn fail_unsettled(&self) {
        let registry = &self.worker.ctx.registry;
        let Some(mut task) = registry.lookup(&self.task_id) else {
            return;
        };
        if task.status != TaskStatus::Running {
            return;
        }

        task.status = TaskStatus::Failure;
        task.error = Some("worker fault while running task".to_string());
        task.worker_id = Some(self.worker.id.clone());
        task.completed_at = Some(Utc::now());
        registry.update(task);

        self.worker.stats.lock().tasks_failed += 1;
        self.worker.ctx.metrics.record_failure();
        tracing::error!(worker = %self.worker.id, task_id = %self.task_id, "task lost to a worker fault, marked failed");
    }
}

impl Drop for ActiveTask<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.fail_unsettled();
        }

        let mut stats = self.worker.stats.lock();
        stats.current_task = None;
        stats.status = WorkerStatus::Idle;
        stats.last_heartbeat = Some(Utc::now());
    }
}

impl Worker {
    pub fn new(index: usize, ctx: WorkerContext) -> Self {
        let id = format!("worker-{}", index);
        Self {
            stats: Arc::new(Mutex::new(WorkerStats::new(id.clone()))),
            id,
            ctx,
        }
    }

    // main loop
    pub fn run(&self) {
        {
            let mut stats = self.stats.lock();
            stats.status = WorkerStatus::Idle;
            stats.last_heartbeat = Some(Utc::now());
        }
        tracing::info!(worker = %self.id, "worker started");

        while !self.ctx.shutdown.load(Ordering::Acquire) {
            // dequeue returns once poll_interval elapses or dispatch is closed
            let step = catch_unwind(AssertUnwindSafe(|| self.step()));
            if step.is_err() {
                tracing::error!(worker = %self.id, "worker fault while dispatching, pausing");
                thread::sleep(self.ctx.error_pause);
            }
        }

        self.stats.lock().status = WorkerStatus::Stopped;
        tracing::info!(worker = %self.id, "worker stopped");
    }

    fn step(&self) {
        match self.ctx.registry.dequeue(self.ctx.poll_interval) {
            // claimed just as stop was requested; hand it back untouched
            Some(task) if self.ctx.shutdown.load(Ordering::Acquire) => {
                self.ctx.registry.requeue(task);
            }
            Some(task) => self.process(task),
            None => {
                self.stats.lock().last_heartbeat = Some(Utc::now());
                self.ctx.registry.evict_expired();
            }
        }
    }

    fn process(&self, mut task: Task) {
        let mut active = ActiveTask::enter(self, &task.id);
        tracing::debug!(
            worker = %self.id,
            task_id = %task.id,
            function = %task.function_name,
            attempt = task.retry_count + 1,
            "running task"
        );

        let started = Instant::now();
        let outcome = self.invoke(&task);
        self.ctx.metrics.record_attempt(started.elapsed());

        let requeue = self.reconcile(&mut task, outcome);
        if requeue {
            self.ctx.registry.update(task.clone());
            self.ctx.registry.requeue(task);
        } else {
            self.ctx.registry.update(task);
        }
        active.settle();
    }

    fn invoke(&self, task: &Task) -> TaskOutcome {
        let func = self.ctx.functions.get(&task.function_name).ok_or_else(|| {
            TaskError::permanent(format!("Unknown task function: {}", task.function_name))
        })?;

        match task.timeout {
            Some(timeout) => self.invoke_with_timeout(func, task.args.clone(), timeout, &task.id),
            None => self.run_guarded(&func, &task.args),
        }
    }

    fn run_guarded(&self, func: &TaskFn, args: &TaskArgs) -> TaskOutcome {
        self.ctx.panic_handler.run_task(|| func(args))
    }

    /// Runs the attempt on its own thread and waits at most `timeout`.
    /// A late attempt is abandoned, not stopped; whatever it eventually
    /// sends is dropped with the channel.
    fn invoke_with_timeout(
        &self,
        func: TaskFn,
        args: TaskArgs,
        timeout: Duration,
        task_id: &TaskId,
    ) -> TaskOutcome {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let panic_handler = self.ctx.panic_handler.clone();

        let mut builder = thread::Builder::new().name(format!("{}-attempt", self.id));
        if let Some(stack_size) = self.ctx.stack_size {
            builder = builder.stack_size(stack_size);
        }

        builder
            .spawn(move || {
                let outcome = panic_handler.run_task(|| func(&args));
                let _ = tx.send(outcome);
            })
            .map_err(|e| TaskError::failed(format!("failed to spawn attempt thread: {}", e)))?;

        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.ctx.metrics.record_timeout();
                tracing::warn!(
                    worker = %self.id,
                    task_id = %task_id,
                    timeout_secs = timeout.as_secs_f64(),
                    "task attempt timed out, abandoning it"
                );
                Err(TaskError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(TaskError::failed(
                "attempt thread exited without reporting a result",
            )),
        }
    }

    /// Applies an attempt's outcome to the task. Returns `true` when the
    /// task should go back on the queue.
    fn reconcile(&self, task: &mut Task, outcome: TaskOutcome) -> bool {
        task.worker_id = Some(self.id.clone());

        match outcome {
            Ok(value) => {
                task.status = TaskStatus::Success;
                task.result = Some(value);
                task.completed_at = Some(Utc::now());

                self.stats.lock().tasks_completed += 1;
                self.ctx.metrics.record_success();
                tracing::debug!(worker = %self.id, task_id = %task.id, "task completed successfully");
                false
            }
            Err(err) => {
                tracing::error!(worker = %self.id, task_id = %task.id, error = %err, "task failed");
                task.error = Some(err.to_string());

                if !err.is_permanent() && task.retry_count < task.max_retries {
                    task.retry_count += 1;
                    task.status = TaskStatus::Retry;
                    task.started_at = None;

                    self.ctx.metrics.record_retry();
                    tracing::info!(
                        task_id = %task.id,
                        retry = task.retry_count,
                        max_retries = task.max_retries,
                        "task queued for retry"
                    );
                    true
                } else {
                    task.status = TaskStatus::Failure;
                    task.completed_at = Some(Utc::now());

                    self.stats.lock().tasks_failed += 1;
                    self.ctx.metrics.record_failure();
                    false
                }
            }
        }
    }
}
