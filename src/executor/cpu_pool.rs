//! Work-stealing thread pool behind `parallel_map` and `pipeline`.
//!
//! These pools never see priority-queue tasks; they only run scatter/gather
//! jobs. Each thread keeps a local FIFO deque, refills it in batches from
//! the shared injector and steals from siblings when both are empty.

use crate::error::{Error, Result};
use crossbeam_deque::{Injector, Steal, Stealer, Worker as LocalQueue};
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[cfg(target_os = "linux")]
fn pin_thread_to_core(core_id: usize) {
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut cpuset);
        let result = libc::sched_setaffinity(
            0, // current thread
            std::mem::size_of::<libc::cpu_set_t>(),
            &cpuset,
        );
        if result != 0 {
            tracing::warn!(
                thread = std::thread::current().name().unwrap_or("unknown"),
                core_id,
                "failed to pin thread to core"
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub name: String,
    pub num_threads: usize,
    pub stack_size: Option<usize>,
    pub pin_workers: bool,
}

pub struct CpuPool {
    name: String,
    threads: Mutex<Vec<JoinHandle<()>>>,
    unparkers: Vec<thread::Thread>,
    injector: Arc<Injector<Job>>,
    shutdown: Arc<AtomicBool>,
    num_threads: usize,
    pending_jobs: Arc<AtomicUsize>,
    next_wake: AtomicUsize,
    // held shared while pushing, exclusively while raising `shutdown`
    gate: RwLock<()>,
}

impl CpuPool {
    pub fn new(options: &PoolOptions) -> Result<Self> {
        let num_threads = options.num_threads;
        if num_threads == 0 {
            return Err(Error::config("need at least 1 thread"));
        }

        let injector = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let pending_jobs = Arc::new(AtomicUsize::new(0));

        let workers: Vec<PoolWorker> = (0..num_threads).map(PoolWorker::new).collect();
        let stealers: Vec<Stealer<Job>> = workers.iter().map(|w| w.local.stealer()).collect();

        let mut threads = Vec::with_capacity(num_threads);
        let mut unparkers = Vec::with_capacity(num_threads);

        for worker in workers {
            let index = worker.index;
            let stealers = stealers.clone();
            let injector = injector.clone();
            let shutdown_flag = shutdown.clone();
            let pending = pending_jobs.clone();
            let pin_workers = options.pin_workers;

            let mut builder = thread::Builder::new().name(format!("{}-{}", options.name, index));
            if let Some(stack_size) = options.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let spawned = builder.spawn(move || {
                #[cfg(target_os = "linux")]
                if pin_workers {
                    pin_thread_to_core(index);
                }
                #[cfg(not(target_os = "linux"))]
                let _ = pin_workers;

                worker.run(&stealers, &injector, &shutdown_flag, &pending);
            });

            match spawned {
                Ok(handle) => {
                    unparkers.push(handle.thread().clone());
                    threads.push(handle);
                }
                Err(e) => {
                    // let the threads that did start wind down on their own
                    shutdown.store(true, Ordering::Release);
                    for t in &unparkers {
                        t.unpark();
                    }
                    return Err(Error::executor(format!("spawn failed: {}", e)));
                }
            }
        }

        tracing::debug!(pool = %options.name, num_threads, "started pool");

        Ok(Self {
            name: options.name.clone(),
            threads: Mutex::new(threads),
            unparkers,
            injector,
            shutdown,
            num_threads,
            pending_jobs,
            next_wake: AtomicUsize::new(0),
            gate: RwLock::new(()),
        })
    }

    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let _gate = self.gate.read();
            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::executor(format!("pool {} is shut down", self.name)));
            }

            self.pending_jobs.fetch_add(1, Ordering::AcqRel);
            self.injector.push(Box::new(f));
        }

        let next = self.next_wake.fetch_add(1, Ordering::Relaxed) % self.unparkers.len();
        self.unparkers[next].unpark();
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn pending_jobs(&self) -> usize {
        self.pending_jobs.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stops accepting jobs, lets queued ones drain, then joins every thread.
    ///
    /// A job accepted just before the flag was raised can miss every pool
    /// thread on its way out; such leftovers run on the calling thread.
    pub fn shutdown(&self) {
        {
            let _gate = self.gate.write();
            self.shutdown.store(true, Ordering::Release);
        }

        // wake everyone up to check shutdown flag
        for t in &self.unparkers {
            t.unpark();
        }

        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!(pool = %self.name, "pool thread panicked");
            }
        }

        self.run_leftovers();
    }

    fn run_leftovers(&self) {
        let mut leftovers = 0usize;
        loop {
            match self.injector.steal() {
                Steal::Success(job) => {
                    leftovers += 1;
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!(pool = %self.name, "pool job panicked");
                    }
                    self.pending_jobs.fetch_sub(1, Ordering::AcqRel);
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        if leftovers > 0 {
            tracing::debug!(pool = %self.name, leftovers, "ran jobs left behind by exited threads");
        }
    }
}

impl Drop for CpuPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CpuPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuPool")
            .field("name", &self.name)
            .field("num_threads", &self.num_threads)
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

struct PoolWorker {
    index: usize,
    local: LocalQueue<Job>,
}

impl PoolWorker {
    fn new(index: usize) -> Self {
        Self {
            index,
            local: LocalQueue::new_fifo(),
        }
    }

    // main loop; exits once shut down and nothing is left to run anywhere
    fn run(
        &self,
        stealers: &[Stealer<Job>],
        injector: &Injector<Job>,
        shutdown: &AtomicBool,
        pending: &AtomicUsize,
    ) {
        let mut backoff_cnt = 0;

        loop {
            if let Some(job) = self.find_job(stealers, injector) {
                backoff_cnt = 0;
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(worker = self.index, "pool job panicked");
                }
                pending.fetch_sub(1, Ordering::AcqRel);
            } else if shutdown.load(Ordering::Acquire) {
                break;
            } else {
                Self::backoff(&mut backoff_cnt);
            }
        }
    }

    fn find_job(&self, stealers: &[Stealer<Job>], injector: &Injector<Job>) -> Option<Job> {
        // local queue first, then the injector, then siblings
        if let Some(job) = self.local.pop() {
            return Some(job);
        }

        loop {
            match injector.steal_batch_and_pop(&self.local) {
                Steal::Success(job) => return Some(job),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        self.try_steal_from_workers(stealers)
    }

    fn try_steal_from_workers(&self, stealers: &[Stealer<Job>]) -> Option<Job> {
        use rand::seq::SliceRandom;
        use rand::thread_rng;

        let mut indices: Vec<usize> = (0..stealers.len()).filter(|&i| i != self.index).collect();
        indices.shuffle(&mut thread_rng());

        for idx in indices {
            loop {
                match stealers[idx].steal_batch_and_pop(&self.local) {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn backoff(count: &mut u32) {
        const MAX_SPINS: u32 = 10;
        const MAX_YIELDS: u32 = 20;

        *count += 1;

        if *count <= MAX_SPINS {
            let spins = (*count).min(6);
            for _ in 0..(1 << spins) {
                std::hint::spin_loop();
            }
        } else if *count <= MAX_YIELDS {
            thread::yield_now();
        } else {
            thread::park_timeout(Duration::from_micros(100));
        }
    }
}
