//! Lifecycle events.
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel. Emission
//! never blocks the scheduler; a subscriber that falls behind sees
//! `RecvError::Lagged` and loses the oldest events.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::TaskFailure;
use crate::task::{Priority, TaskId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskScheduled {
        task_id: TaskId,
        priority: Priority,
    },
    TaskStarted {
        task_id: TaskId,
        worker_id: usize,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        execution_time: Duration,
        retry_count: u32,
    },
    TaskFailed {
        task_id: TaskId,
        error: TaskFailure,
        retry_count: u32,
    },
    TaskRetry {
        task_id: TaskId,
        retry_count: u32,
        delay: Duration,
        error: String,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    QueueFull {
        task_id: Option<TaskId>,
        capacity: usize,
    },
    WorkerBusy {
        worker_id: usize,
        task_id: TaskId,
    },
    WorkerAvailable {
        worker_id: usize,
    },
}

impl SchedulerEvent {
    /// Wire name, e.g. `task:scheduled`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskScheduled { .. } => "task:scheduled",
            Self::TaskStarted { .. } => "task:started",
            Self::TaskCompleted { .. } => "task:completed",
            Self::TaskFailed { .. } => "task:failed",
            Self::TaskRetry { .. } => "task:retry",
            Self::TaskCancelled { .. } => "task:cancelled",
            Self::QueueFull { .. } => "queue:full",
            Self::WorkerBusy { .. } => "worker:busy",
            Self::WorkerAvailable { .. } => "worker:available",
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskScheduled { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskRetry { task_id, .. }
            | Self::TaskCancelled { task_id }
            | Self::WorkerBusy { task_id, .. } => Some(task_id),
            Self::QueueFull { task_id, .. } => task_id.as_ref(),
            Self::WorkerAvailable { .. } => None,
        }
    }
}

/// Sending half of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: SchedulerEvent) {
        trace!(event = event.name(), task_id = ?event.task_id(), "scheduler event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}
