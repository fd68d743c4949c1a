//! The engine façade: task submission, lifecycle queries, worker lifecycle
//! and the scatter/gather helpers.
//!
//! ```no_run
//! use taskweave::prelude::*;
//! use serde_json::json;
//!
//! let engine = Engine::new(Config::default()).unwrap();
//! engine.register("add", |args: &TaskArgs| {
//!     let a: i64 = args.get(0)?;
//!     let b: i64 = args.get(1)?;
//!     Ok(json!(a + b))
//! });
//! engine.start().unwrap();
//!
//! let id = engine
//!     .submit("add", TaskArgs::positional([2, 3]), SubmitOptions::default())
//!     .unwrap();
//! assert_eq!(engine.result(&id, None).unwrap(), json!(5));
//!
//! engine.stop();
//! ```

mod parallel;
mod pipeline;

pub use pipeline::{Stage, StageFn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{
    CpuPool, FunctionRegistry, PanicHandler, PoolOptions, SubmitOptions, Task, TaskArgs, TaskId,
    TaskOutcome, TaskStatus, Worker, WorkerContext, WorkerStats,
};
use crate::scheduler::{QueueStats, TaskRegistry};
use crate::telemetry::{Metrics, MetricsSnapshot, StatsExporter};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub num_workers: usize,
    pub max_workers: usize,
    pub max_processes: usize,
    pub queue_capacity: usize,
    pub registered_functions: usize,
    pub queue: QueueStats,
    pub workers: Vec<WorkerStats>,
    pub metrics: MetricsSnapshot,
}

/// Handle to a task engine. Clones share the same engine; the engine is
/// stopped when the last handle is dropped.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    registry: Arc<TaskRegistry>,
    functions: Arc<FunctionRegistry>,
    panic_handler: Arc<PanicHandler>,
    metrics: Arc<Metrics>,
    state: Mutex<RunState>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    exits: Option<Receiver<usize>>,
    // kept after stop so the last known worker stats stay visible
    worker_stats: Vec<Arc<Mutex<WorkerStats>>>,
    thread_pool: Option<Arc<CpuPool>>,
    compute_pool: Option<Arc<CpuPool>>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(TaskRegistry::new(config.queue_capacity, config.retention));
        let panic_handler = Arc::new(PanicHandler::new(config.panic_strategy));

        Ok(Self {
            inner: Arc::new(EngineInner {
                registry,
                functions: Arc::new(FunctionRegistry::new()),
                panic_handler,
                metrics: Arc::new(Metrics::new()),
                state: Mutex::new(RunState::default()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Makes `f` callable by name. Registering an existing name replaces it.
    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&TaskArgs) -> TaskOutcome + Send + Sync + 'static,
    {
        self.inner.functions.register(name, f);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.functions.contains(name)
    }

    /// Queues a call to `function_name`. The name is resolved when a worker
    /// picks the task up, so registering late is fine.
    pub fn submit(
        &self,
        function_name: &str,
        args: TaskArgs,
        options: SubmitOptions,
    ) -> Result<TaskId> {
        let task = Task::new(function_name, args, options);
        let id = task.id.clone();

        self.inner.registry.enqueue(task)?;
        self.inner.metrics.record_submitted();
        tracing::info!(
            task_id = %id,
            function = function_name,
            priority = options.priority,
            "submitted task"
        );
        Ok(id)
    }

    /// Current snapshot of a task.
    pub fn status(&self, id: &TaskId) -> Result<Task> {
        self.inner
            .registry
            .lookup(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// Blocks until the task finishes, or `timeout` elapses. An elapsed
    /// wait leaves the task as it is.
    pub fn result(&self, id: &TaskId, timeout: Option<Duration>) -> Result<Value> {
        let task = self.inner.registry.wait_terminal(id, timeout)?;
        match task.status {
            TaskStatus::Success => Ok(task.result.unwrap_or(Value::Null)),
            TaskStatus::Cancelled => Err(Error::TaskCancelled(task.id)),
            _ => Err(Error::TaskFailed {
                id: task.id,
                error: task.error.unwrap_or_else(|| "unknown error".to_string()),
            }),
        }
    }

    /// Cancels a task that has not started yet.
    pub fn cancel(&self, id: &TaskId) -> Result<()> {
        self.inner.registry.cancel(id)?;
        self.inner.metrics.record_cancelled();
        tracing::info!(task_id = %id, "cancelled task");
        Ok(())
    }

    /// Pending tasks in the order they will be dispatched.
    pub fn pending(&self) -> Vec<Task> {
        self.inner.registry.pending()
    }

    /// Runs the retention sweep now. Returns how many tasks were dropped.
    pub fn purge(&self) -> usize {
        self.inner.registry.evict_expired()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Spawns the workers and both scatter/gather pools. Calling it on a
    /// running engine does nothing.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.running {
            return Ok(());
        }

        let config = &self.inner.config;
        let prefix = &config.thread_name_prefix;

        let thread_pool = Arc::new(CpuPool::new(&PoolOptions {
            name: format!("{}-thread", prefix),
            num_threads: config.max_workers(),
            stack_size: config.stack_size,
            pin_workers: config.pin_workers,
        })?);
        let compute_pool = Arc::new(CpuPool::new(&PoolOptions {
            name: format!("{}-compute", prefix),
            num_threads: config.max_processes(),
            stack_size: config.stack_size,
            pin_workers: config.pin_workers,
        })?);

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = WorkerContext {
            registry: self.inner.registry.clone(),
            functions: self.inner.functions.clone(),
            panic_handler: self.inner.panic_handler.clone(),
            metrics: self.inner.metrics.clone(),
            shutdown: shutdown.clone(),
            poll_interval: config.poll_interval,
            error_pause: config.error_pause,
            stack_size: config.stack_size,
        };

        self.inner.registry.open_dispatch();

        let num_workers = config.worker_threads();
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
        let mut workers = Vec::with_capacity(num_workers);
        let mut worker_stats = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let worker = Worker::new(index, ctx.clone());
            worker_stats.push(worker.stats.clone());
            let exit_tx = exit_tx.clone();

            let mut builder = thread::Builder::new().name(format!("{}-worker-{}", prefix, index));
            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let spawned = builder.spawn(move || {
                worker.run();
                let _ = exit_tx.send(index);
            });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // wind down whatever already started
                    shutdown.store(true, Ordering::Release);
                    self.inner.registry.close_dispatch();
                    thread_pool.shutdown();
                    compute_pool.shutdown();
                    return Err(Error::executor(format!(
                        "failed to spawn worker {}: {}",
                        index, e
                    )));
                }
            }
        }

        *state = RunState {
            running: true,
            shutdown,
            workers,
            exits: Some(exit_rx),
            worker_stats,
            thread_pool: Some(thread_pool),
            compute_pool: Some(compute_pool),
        };

        tracing::info!(
            workers = num_workers,
            max_workers = config.max_workers(),
            max_processes = config.max_processes(),
            "engine started"
        );
        Ok(())
    }

    /// Stops the workers and both pools. Tasks still queued stay Pending;
    /// an attempt in flight is given `shutdown_grace` to finish, after
    /// which its worker is detached. Safe to call repeatedly.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn stats(&self) -> EngineStats {
        let (running, workers) = {
            let state = self.inner.state.lock();
            let workers = state
                .worker_stats
                .iter()
                .map(|stats| stats.lock().clone())
                .collect();
            (state.running, workers)
        };
        let config = &self.inner.config;

        EngineStats {
            running,
            num_workers: config.worker_threads(),
            max_workers: config.max_workers(),
            max_processes: config.max_processes(),
            queue_capacity: config.queue_capacity,
            registered_functions: self.inner.functions.len(),
            queue: self.inner.registry.stats(),
            workers,
            metrics: self.inner.metrics.snapshot(),
        }
    }

    pub fn export_stats(&self, exporter: &dyn StatsExporter) -> Result<()> {
        exporter.export(&self.stats())
    }

    pub(crate) fn pool(&self, use_processes: bool) -> Result<Arc<CpuPool>> {
        let state = self.inner.state.lock();
        let pool = if use_processes {
            &state.compute_pool
        } else {
            &state.thread_pool
        };
        pool.clone()
            .ok_or_else(|| Error::executor("engine is not running"))
    }
}

impl EngineInner {
    fn stop(&self) {
        let (shutdown, workers, exits, thread_pool, compute_pool) = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            (
                state.shutdown.clone(),
                std::mem::take(&mut state.workers),
                state.exits.take(),
                state.thread_pool.take(),
                state.compute_pool.take(),
            )
        };

        tracing::info!("stopping engine");
        shutdown.store(true, Ordering::Release);
        self.registry.close_dispatch();

        let deadline = Instant::now().checked_add(self.config.shutdown_grace);
        let mut exited = vec![false; workers.len()];
        let mut outstanding = workers.len();
        if let Some(exits) = exits {
            while outstanding > 0 {
                let received = match deadline {
                    Some(deadline) => {
                        exits.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                    }
                    None => exits.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match received {
                    Ok(index) => {
                        if let Some(flag) = exited.get_mut(index) {
                            if !*flag {
                                *flag = true;
                                outstanding -= 1;
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
        }

        for (index, handle) in workers.into_iter().enumerate() {
            if exited[index] {
                if handle.join().is_err() {
                    tracing::error!(worker = index, "worker thread panicked");
                }
            } else {
                tracing::warn!(
                    worker = index,
                    grace_secs = self.config.shutdown_grace.as_secs_f64(),
                    "worker still busy after shutdown grace, detaching"
                );
            }
        }

        for pool in [thread_pool, compute_pool].into_iter().flatten() {
            pool.shutdown();
        }

        tracing::info!("engine stopped");
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.is_running())
            .field("registered_functions", &self.inner.functions.len())
            .field("tasks", &self.inner.registry.len())
            .finish()
    }
}
