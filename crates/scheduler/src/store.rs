use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::task::{TaskId, TaskResult, TaskStatus};

/// Completed and failed result tables. Cancelled tasks are kept in the
/// failed table; their status tells them apart.
#[derive(Debug, Default)]
pub struct ResultStore {
    completed: HashMap<TaskId, TaskResult>,
    failed: HashMap<TaskId, TaskResult>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, result: TaskResult) {
        let id = result.task_id.clone();
        match result.status {
            TaskStatus::Completed => {
                self.failed.remove(&id);
                self.completed.insert(id, result);
            }
            _ => {
                self.completed.remove(&id);
                self.failed.insert(id, result);
            }
        }
    }

    /// Looks in the completed table first, then the failed one.
    pub fn get(&self, id: &TaskId) -> Option<&TaskResult> {
        self.completed.get(id).or_else(|| self.failed.get(id))
    }

    pub fn completed(&self, id: &TaskId) -> Option<&TaskResult> {
        self.completed.get(id)
    }

    pub fn failed(&self, id: &TaskId) -> Option<&TaskResult> {
        self.failed.get(id)
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<TaskResult> {
        self.completed.remove(id).or_else(|| self.failed.remove(id))
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Completed => self.completed.len(),
            _ => self.failed.values().filter(|r| r.status == status).count(),
        }
    }

    pub fn iter_completed(&self) -> impl Iterator<Item = &TaskResult> {
        self.completed.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskResult> {
        self.completed.values().chain(self.failed.values())
    }

    /// Drop results that completed before `cutoff`. Returns the removed ids.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> Vec<TaskId> {
        let mut removed = Vec::new();
        for table in [&mut self.completed, &mut self.failed] {
            table.retain(|id, result| {
                let keep = result.completed_at >= cutoff;
                if !keep {
                    removed.push(id.clone());
                }
                keep
            });
        }
        removed
    }
}
