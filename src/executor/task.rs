//! Task records and their lifecycle states.

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Global submission counter, breaks ties between equal `created_at` stamps
static TASK_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Opaque task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub(crate) fn generate() -> Self {
        TaskId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        TaskId(id)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        TaskId(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Retry,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Failure,
        TaskStatus::Retry,
        TaskStatus::Cancelled,
    ];

    /// No transition leaves a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Retry => "retry",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Positional and keyed arguments captured at submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            args: values.into_iter().map(Into::into).collect(),
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Decode positional argument `index`. Missing or malformed arguments
    /// are permanent errors.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self.args.get(index).ok_or_else(|| {
            TaskError::permanent(format!("missing positional argument {}", index))
        })?;
        Ok(T::deserialize(value)?)
    }

    /// Decode keyed argument `name`, `None` if absent.
    pub fn get_kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TaskError> {
        match self.kwargs.get(name) {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.args.len() + self.kwargs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

/// Per-submission knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Higher values are served first.
    pub priority: i32,
    /// Additional attempts allowed after the first failure.
    pub max_retries: u32,
    /// Wall-clock budget for one attempt. When it elapses the worker stops
    /// waiting and records a timeout; the attempt itself is abandoned, not
    /// killed, and may keep running in the background. Functions with side
    /// effects can therefore run more than once concurrently when retried.
    pub timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_retries: 3,
            timeout: None,
        }
    }
}

/// One unit of work and its execution history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub function_name: String,
    pub args: TaskArgs,
    pub priority: i32,
    pub max_retries: u32,
    pub retry_count: u32,
    pub timeout: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    #[serde(skip)]
    pub(crate) sequence: u64,
}

impl Task {
    pub(crate) fn new(function_name: &str, args: TaskArgs, options: SubmitOptions) -> Self {
        Task {
            id: TaskId::generate(),
            function_name: function_name.to_string(),
            args,
            priority: options.priority,
            max_retries: options.max_retries,
            retry_count: 0,
            timeout: options.timeout,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            worker_id: None,
            sequence: TASK_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Attempts made so far, counting the one in flight.
    pub fn attempts(&self) -> u32 {
        match self.status {
            TaskStatus::Pending | TaskStatus::Cancelled => self.retry_count,
            _ => self.retry_count + 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time between claim and completion of the last attempt.
    pub fn run_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("echo", TaskArgs::new(), SubmitOptions::default());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert!(task.started_at.is_none());
        assert!(task.timeout.is_none());
        assert_eq!(task.attempts(), 0);
    }

    #[test]
    fn test_task_ids_unique() {
        let a = Task::new("f", TaskArgs::new(), SubmitOptions::default());
        let b = Task::new("f", TaskArgs::new(), SubmitOptions::default());
        assert_ne!(a.id, b.id);
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failure.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Retry.is_terminal());
    }

    #[test]
    fn test_args_decoding() {
        let args = TaskArgs::positional([1, 2]).kwarg("scale", 3.5);
        assert_eq!(args.get::<i64>(0).unwrap(), 1);
        assert_eq!(args.get_kwarg::<f64>("scale").unwrap(), Some(3.5));
        assert_eq!(args.get_kwarg::<f64>("offset").unwrap(), None);
        assert_eq!(args.len(), 3);

        let missing = args.get::<i64>(5).unwrap_err();
        assert!(missing.is_permanent());

        let wrong_type = args.get::<String>(0).unwrap_err();
        assert!(wrong_type.is_permanent());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(TaskStatus::Retry).unwrap(), json!("retry"));
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_submit_options_builder() {
        let options = SubmitOptions::new()
            .priority(10)
            .max_retries(0)
            .timeout(Duration::from_secs(1));
        assert_eq!(options.priority, 10);
        assert_eq!(options.max_retries, 0);
        assert_eq!(options.timeout, Some(Duration::from_secs(1)));
    }
}
