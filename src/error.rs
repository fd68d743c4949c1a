use crate::executor::task::{TaskId, TaskStatus};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("executor error: {0}")]
    Executor(String),

    #[error("engine not initialized")]
    NotInitialized,

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {id} failed: {error}")]
    TaskFailed { id: TaskId, error: String },

    #[error("task {0} was cancelled")]
    TaskCancelled(TaskId),

    #[error("task {id} cannot be cancelled while {status}")]
    NotCancellable { id: TaskId, status: TaskStatus },

    #[error("task result timeout after {0:?}")]
    ResultTimeout(Duration),

    #[error("task queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("pipeline stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn executor<S: Into<String>>(msg: S) -> Self {
        Error::Executor(msg.into())
    }

    pub fn stage<S: Into<String>, M: Into<String>>(stage: S, message: M) -> Self {
        Error::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Failure reported by a task body (or by the worker on its behalf).
///
/// The `Display` text is what ends up in [`Task::error`](crate::Task).
/// Only [`TaskError::Permanent`] skips the retry budget.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("{0}")]
    Permanent(String),

    #[error("task execution timeout after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed<S: Into<String>>(msg: S) -> Self {
        TaskError::Failed(msg.into())
    }

    pub fn permanent<S: Into<String>>(msg: S) -> Self {
        TaskError::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, TaskError::Permanent(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout(_))
    }
}

impl From<String> for TaskError {
    fn from(msg: String) -> Self {
        TaskError::Failed(msg)
    }
}

impl From<&str> for TaskError {
    fn from(msg: &str) -> Self {
        TaskError::Failed(msg.to_string())
    }
}

// Argument decoding problems never go away on retry.
impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Permanent(format!("malformed arguments: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_classification() {
        assert!(TaskError::permanent("bad").is_permanent());
        assert!(!TaskError::failed("flaky").is_permanent());
        assert!(TaskError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(!TaskError::Timeout(Duration::from_secs(1)).is_permanent());
    }

    #[test]
    fn test_task_error_display() {
        assert_eq!(TaskError::failed("boom").to_string(), "boom");
        assert_eq!(
            TaskError::Timeout(Duration::from_secs(2)).to_string(),
            "task execution timeout after 2 seconds"
        );
        assert_eq!(
            TaskError::Panicked("oops".into()).to_string(),
            "task panicked: oops"
        );
    }

    #[test]
    fn test_malformed_arguments_are_permanent() {
        let err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        let task_err: TaskError = err.into();
        assert!(task_err.is_permanent());
        assert!(task_err.to_string().starts_with("malformed arguments"));
    }
}
