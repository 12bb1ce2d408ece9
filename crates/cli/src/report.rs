use chrono::{DateTime, Utc};
use serde::Serialize;

use qualis_scheduler::{
    ErrorKind, SchedulerError, SchedulerMetrics, TaskResult, TaskStatistics, TaskStatus,
};

/// Outcome of one tool in a run.
#[derive(Debug, Clone, Serialize)]
pub struct ToolReport {
    pub name: String,
    pub status: TaskStatus,
    pub duration_ms: u128,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolReport {
    pub fn from_result(name: &str, result: &TaskResult) -> Self {
        let exit_code = result
            .output
            .as_ref()
            .and_then(|o| o.payload.get("exit_code"))
            .and_then(|v| v.as_i64());
        Self {
            name: name.to_string(),
            status: result.status,
            duration_ms: result.execution_time.as_millis(),
            retry_count: result.retry_count,
            exit_code,
            error_kind: result.error.as_ref().map(|e| e.kind),
            error: result.error_message().map(str::to_string),
        }
    }

    /// A tool whose result could not be collected.
    pub fn unresolved(name: &str, error: &SchedulerError) -> Self {
        Self {
            name: name.to_string(),
            status: TaskStatus::Failed,
            duration_ms: 0,
            retry_count: 0,
            exit_code: None,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Summary of a whole plan run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tools: Vec<ToolReport>,
    pub metrics: SchedulerMetrics,
    pub statistics: TaskStatistics,
}

impl RunReport {
    pub fn passed(&self) -> usize {
        self.tools.iter().filter(|t| t.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.tools.len() - self.passed()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}
