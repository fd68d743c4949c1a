//! taskweave - in-process priority task engine
//!
//! Accepts named units of work, orders them by priority, dispatches them to
//! a fixed set of dedicated worker threads, retries failures within a
//! budget and enforces per-task timeouts. Separate work-stealing pools back
//! the scatter/gather helpers, which never touch the priority queue.
//!
//! # Quick Start
//!
//! ```no_run
//! use taskweave::prelude::*;
//! use serde_json::json;
//!
//! let engine = Engine::new(Config::default()).unwrap();
//! engine.register("greet", |args: &TaskArgs| {
//!     let name: String = args.get(0)?;
//!     Ok(json!(format!("hello {}", name)))
//! });
//! engine.start().unwrap();
//!
//! let id = engine
//!     .submit("greet", TaskArgs::positional(["world"]), SubmitOptions::default().priority(5))
//!     .unwrap();
//! println!("{}", engine.result(&id, None).unwrap());
//!
//! // scatter/gather, output aligned with input
//! let squares = engine
//!     .parallel_map(|x: u64| Ok::<_, TaskError>(x * x), (0..10).collect(), None, false)
//!     .unwrap();
//! assert_eq!(squares[3], Some(9));
//!
//! engine.stop();
//! ```
//!
//! # Features
//!
//! - **Priority dispatch**: higher priority first, FIFO within a priority
//! - **Retries**: transient failures are retried up to `max_retries` times
//! - **Timeouts**: per-task attempt deadlines (the attempt is abandoned, not killed)
//! - **Cancellation**: pending tasks can be cancelled before they start
//! - **Scatter/gather**: `parallel_map` and `pipeline` on work-stealing pools
//! - **Telemetry**: counters and latency histograms (optional)

#![warn(missing_debug_implementations)]

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;

pub use config::{Config, ConfigBuilder, RetentionPolicy};
pub use engine::{Engine, EngineStats, Stage};
pub use error::{Error, Result, TaskError};
pub use executor::{SubmitOptions, Task, TaskArgs, TaskId, TaskOutcome, TaskStatus};
pub use runtime::{global, init, init_with_config, shutdown};
pub use serde_json::Value;
