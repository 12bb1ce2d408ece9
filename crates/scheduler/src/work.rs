//! The unit-of-work contract consumed by the scheduler.
//!
//! Each task wraps one [`UnitOfWork`]: in practice a single analysis tool
//! invocation. The scheduler never interprets the payload it returns; it only
//! looks at the [`WorkStatus`] to decide between success and failure.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::task::TaskId;

/// Execution context handed to every attempt.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub task_id: TaskId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cooperative cancellation signal. Fired when the task is cancelled or
    /// the scheduler shuts down while the attempt is still running.
    pub cancel: CancellationToken,
}

impl WorkContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Success,
    Error,
}

/// Structured output of a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOutput {
    pub status: WorkStatus,
    /// Tool-specific payload, passed through untouched.
    #[serde(default)]
    pub payload: Value,
}

impl WorkOutput {
    pub fn success(payload: Value) -> Self {
        Self {
            status: WorkStatus::Success,
            payload,
        }
    }

    pub fn error(payload: Value) -> Self {
        Self {
            status: WorkStatus::Error,
            payload,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkStatus::Success
    }

    /// Human-readable description of an error-classified output. Uses the
    /// payload's `error` or `message` string field when present.
    pub fn error_message(&self) -> String {
        ["error", "message"]
            .iter()
            .find_map(|key| self.payload.get(key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| format!("unit of work reported error: {}", self.payload))
    }
}

/// Error raised by a unit of work.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("{0}")]
    Failed(String),

    #[error("work observed cancellation")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An asynchronous, opaque unit of work.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    async fn execute(&self, ctx: WorkContext) -> Result<WorkOutput, WorkError>;
}

/// Adapter turning an async closure into a [`UnitOfWork`].
pub struct FnWork<F> {
    name: String,
    f: F,
}

impl<F> FnWork<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> UnitOfWork for FnWork<F>
where
    F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkOutput, WorkError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: WorkContext) -> Result<WorkOutput, WorkError> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a shareable unit of work.
pub fn work_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn UnitOfWork>
where
    F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkOutput, WorkError>> + Send + 'static,
{
    Arc::new(FnWork::new(name, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_message_prefers_error_field() {
        let out = WorkOutput::error(json!({ "error": "eslint exited with 2", "message": "ignored" }));
        assert_eq!(out.error_message(), "eslint exited with 2");

        let out = WorkOutput::error(json!({ "message": "3 type errors" }));
        assert_eq!(out.error_message(), "3 type errors");

        let out = WorkOutput::error(json!({ "exit_code": 1 }));
        assert!(out.error_message().contains("exit_code"));
    }

    #[tokio::test]
    async fn fn_work_runs_closure() {
        let work = work_fn("echo", |ctx: WorkContext| async move {
            Ok(WorkOutput::success(json!({ "task": ctx.task_id.to_string(), "attempt": ctx.attempt })))
        });
        assert_eq!(work.name(), "echo");

        let ctx = WorkContext {
            task_id: TaskId::from("t1"),
            attempt: 1,
            cancel: CancellationToken::new(),
        };
        let out = work.execute(ctx).await.unwrap();
        assert!(out.is_success());
        assert_eq!(out.payload["task"], "t1");
        assert_eq!(out.payload["attempt"], 1);
    }

    #[test]
    fn output_roundtrips_through_json() {
        let out = WorkOutput::success(json!({ "issues": 0 }));
        let text = serde_json::to_string(&out).unwrap();
        assert!(text.contains("\"status\":\"success\""));
        let back: WorkOutput = serde_json::from_str(&text).unwrap();
        assert_eq!(back, out);
    }
}
