use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::error::ErrorKind;

/// Scheduler operational metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Queued tasks plus tasks waiting out a retry backoff.
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    /// Tasks accepted since the scheduler was created.
    pub total_scheduled: u64,
    /// Retry attempts since the scheduler was created.
    pub total_retries: u64,
    /// Mean execution time over stored completed results.
    pub average_execution_time: Duration,
    pub busy_workers: usize,
    pub total_workers: usize,
    /// Worker utilization ratio (0.0 - 1.0).
    pub worker_utilization: f64,
    pub queued_tasks: usize,
    pub queue_capacity: usize,
    /// Queue utilization ratio (0.0 - 1.0, may exceed 1.0 right after the
    /// capacity was lowered).
    pub queue_utilization: f64,
}

/// Min/max/mean over a set of execution times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DurationSummary {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
}

impl DurationSummary {
    pub fn from_durations(durations: impl IntoIterator<Item = Duration>) -> Self {
        let mut summary = Self::default();
        for d in durations {
            summary.record(d);
        }
        summary
    }

    /// Fold one more sample in.
    pub fn record(&mut self, duration: Duration) {
        self.count += 1;
        if self.count == 1 {
            self.min = duration;
            self.max = duration;
            self.mean = duration;
            return;
        }
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let prev_nanos = self.mean.as_nanos() as f64;
        let cur_nanos = duration.as_nanos() as f64;
        let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / self.count as f64;
        self.mean = Duration::from_nanos(avg_nanos as u64);
    }
}

/// Aggregate view over every task the scheduler currently knows about.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatistics {
    pub total_tasks: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// completed / (completed + failed), 0.0 when nothing has finished.
    pub success_rate: f64,
    /// Sum of retry counts over known tasks.
    pub total_retries: u64,
    pub execution_time: DurationSummary,
    pub failures_by_kind: HashMap<ErrorKind, usize>,
}

impl TaskStatistics {
    pub(crate) fn finish(mut self) -> Self {
        let finished = self.completed + self.failed;
        self.success_rate = if finished == 0 {
            0.0
        } else {
            self.completed as f64 / finished as f64
        };
        self
    }
}
