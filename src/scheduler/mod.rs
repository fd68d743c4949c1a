//! Task storage and dispatch ordering.
//!
//! [`TaskRegistry`] owns every task record for the life of the engine (up
//! to the retention policy) and feeds workers from a [`TaskQueue`] ordered
//! by priority, then creation time.

pub mod priority;
pub mod registry;

pub use priority::{QueueEntry, TaskQueue};
pub use registry::{QueueStats, TaskRegistry};
