use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Errors produced by the scheduler, both at submission time and as the
/// recorded cause of a failed task.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("dependency not found: task '{task}' depends on unknown task '{dependency}'")]
    DependencyNotFound { task: TaskId, dependency: TaskId },

    #[error("dependency failed: task '{task}' depends on '{dependency}' which is {status}")]
    DependencyFailed {
        task: TaskId,
        dependency: TaskId,
        status: TaskStatus,
    },

    #[error("circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task '{0}' is already scheduled")]
    DuplicateTask(TaskId),

    #[error("gave up waiting for task '{task}' after {waited:?}")]
    WaitTimeout { task: TaskId, waited: Duration },

    #[error("task was cancelled")]
    Cancelled,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config I/O error: {0}")]
    ConfigIo(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl SchedulerError {
    /// Only failures of the work itself are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(_) | Self::Timeout(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Execution(_) => ErrorKind::Execution,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::DependencyNotFound { .. } => ErrorKind::DependencyNotFound,
            Self::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            Self::CircularDependency(_) => ErrorKind::CircularDependency,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DuplicateTask(_)
            | Self::WaitTimeout { .. }
            | Self::InvalidConfig(_)
            | Self::ConfigIo(_)
            | Self::ConfigParse(_) => ErrorKind::Other,
        }
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(e: std::io::Error) -> Self {
        Self::ConfigIo(e.to_string())
    }
}

/// Classification of a failure, stored alongside the message on a
/// [`TaskResult`](crate::TaskResult).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Execution,
    Timeout,
    DependencyNotFound,
    DependencyFailed,
    CircularDependency,
    QueueFull,
    NotFound,
    Cancelled,
    Other,
}

/// Failure recorded on a terminal task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SchedulerError> for TaskFailure {
    fn from(e: &SchedulerError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
