//! Bounded priority queue of pending tasks.
//!
//! Entries are kept sorted by descending priority; equal priorities keep
//! insertion order. A task re-entering the queue after a retry counts as a
//! fresh insertion.

use crate::error::SchedulerError;
use crate::task::{Priority, TaskId};

/// A pending task waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: TaskId,
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
}

#[derive(Debug)]
pub struct PriorityQueue {
    entries: Vec<QueuedTask>,
    capacity: usize,
    /// Bumped on every insertion; lets callers memoize work that only
    /// changes when new tasks arrive.
    generation: u64,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            generation: 0,
        }
    }

    /// Insert a task as far forward as its priority allows.
    ///
    /// Fails with [`SchedulerError::QueueFull`] without enqueuing when the
    /// queue is at capacity.
    pub fn insert(
        &mut self,
        id: TaskId,
        priority: Priority,
        dependencies: Vec<TaskId>,
    ) -> Result<(), SchedulerError> {
        if self.is_full() {
            return Err(SchedulerError::QueueFull {
                capacity: self.capacity,
            });
        }
        let pos = self.entries.partition_point(|e| e.priority >= priority);
        self.generation += 1;
        self.entries.insert(
            pos,
            QueuedTask {
                id,
                priority,
                dependencies,
            },
        );
        Ok(())
    }

    /// Remove a specific task (claimed by a worker, cancelled or failed).
    pub fn remove(&mut self, id: &TaskId) -> Option<QueuedTask> {
        let pos = self.entries.iter().position(|e| &e.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn get(&self, id: &TaskId) -> Option<&QueuedTask> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.get(id).is_some()
    }

    /// Iterate in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedTask> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remaining free slots.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.entries.len())
    }

    /// Change capacity. Shrinking below the current length keeps the queued
    /// tasks but rejects new ones until the queue drains.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fraction of capacity in use.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.entries.len() as f64 / self.capacity as f64
        }
    }
}
