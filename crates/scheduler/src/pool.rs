//! Fixed-size pool of execution slots.
//!
//! A slot is either idle or bound to exactly one running task. The pool never
//! hands out a slot while the number of busy slots is at the configured size,
//! which is what bounds concurrency.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::task::TaskId;

#[derive(Debug)]
struct WorkerSlot {
    id: usize,
    task: Option<TaskId>,
    busy_since: Option<Instant>,
    idle_since: Instant,
    tasks_run: u64,
}

impl WorkerSlot {
    fn new(id: usize) -> Self {
        Self {
            id,
            task: None,
            busy_since: None,
            idle_since: Instant::now(),
            tasks_run: 0,
        }
    }

    fn is_busy(&self) -> bool {
        self.task.is_some()
    }
}

/// Point-in-time view of one worker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub busy: bool,
    pub task_id: Option<TaskId>,
    pub busy_for: Option<Duration>,
    pub idle_for: Option<Duration>,
    /// Idle longer than the configured idle timeout. Advisory only.
    pub idle_expired: bool,
    pub tasks_run: u64,
}

#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    size: usize,
    next_id: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let mut pool = Self {
            slots: Vec::with_capacity(size),
            size: 0,
            next_id: 0,
        };
        pool.resize(size);
        pool
    }

    /// Bind an idle slot to `task`. Returns the worker id, or `None` when the
    /// pool is saturated.
    pub fn claim(&mut self, task: &TaskId) -> Option<usize> {
        if self.busy_count() >= self.size {
            return None;
        }
        let slot = self.slots.iter_mut().find(|s| !s.is_busy())?;
        slot.task = Some(task.clone());
        slot.busy_since = Some(Instant::now());
        slot.tasks_run += 1;
        Some(slot.id)
    }

    /// Return a slot to idle. Slots beyond the configured size are retired
    /// once released. Returns false for an unknown or already idle worker.
    pub fn release(&mut self, worker_id: usize) -> bool {
        let Some(pos) = self.slots.iter().position(|s| s.id == worker_id) else {
            return false;
        };
        let slot = &mut self.slots[pos];
        if !slot.is_busy() {
            return false;
        }
        slot.task = None;
        slot.busy_since = None;
        slot.idle_since = Instant::now();

        if self.slots.len() > self.size {
            self.slots.remove(pos);
        }
        true
    }

    /// Change the pool size. Growing adds idle slots immediately; shrinking
    /// drops idle slots now and busy ones as they are released.
    pub fn resize(&mut self, size: usize) {
        self.size = size;
        while self.slots.len() < size {
            self.slots.push(WorkerSlot::new(self.next_id));
            self.next_id += 1;
        }
        while self.slots.len() > size {
            match self.slots.iter().rposition(|s| !s.is_busy()) {
                Some(pos) => {
                    self.slots.remove(pos);
                }
                None => break,
            }
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_busy()).count()
    }

    pub fn idle_count(&self) -> usize {
        self.size.saturating_sub(self.busy_count())
    }

    /// Busy workers as a fraction of the pool size.
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.busy_count() as f64 / self.size as f64
        }
    }

    pub fn task_of(&self, worker_id: usize) -> Option<&TaskId> {
        self.slots
            .iter()
            .find(|s| s.id == worker_id)
            .and_then(|s| s.task.as_ref())
    }

    pub fn snapshots(&self, idle_timeout: Duration) -> Vec<WorkerSnapshot> {
        let now = Instant::now();
        self.slots
            .iter()
            .map(|s| {
                let idle_for = (!s.is_busy()).then(|| now.duration_since(s.idle_since));
                WorkerSnapshot {
                    id: s.id,
                    busy: s.is_busy(),
                    task_id: s.task.clone(),
                    busy_for: s.busy_since.map(|t| now.duration_since(t)),
                    idle_for,
                    idle_expired: idle_for.is_some_and(|d| d >= idle_timeout),
                    tasks_run: s.tasks_run,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_until_saturated() {
        let mut pool = WorkerPool::new(2);
        let a = pool.claim(&"a".into()).unwrap();
        let b = pool.claim(&"b".into()).unwrap();
        assert_ne!(a, b);
        assert!(pool.claim(&"c".into()).is_none());
        assert_eq!(pool.busy_count(), 2);
        assert_eq!(pool.utilization(), 1.0);

        assert!(pool.release(a));
        assert_eq!(pool.idle_count(), 1);
        assert!(pool.claim(&"c".into()).is_some());
    }

    #[test]
    fn release_is_idempotent() {
        let mut pool = WorkerPool::new(1);
        let w = pool.claim(&"a".into()).unwrap();
        assert_eq!(pool.task_of(w), Some(&TaskId::from("a")));
        assert!(pool.release(w));
        assert!(!pool.release(w));
        assert!(!pool.release(99));
    }

    #[test]
    fn shrinking_retires_busy_slots_on_release() {
        let mut pool = WorkerPool::new(3);
        let a = pool.claim(&"a".into()).unwrap();
        let b = pool.claim(&"b".into()).unwrap();
        pool.resize(1);
        // the idle slot is gone, both busy ones remain until released
        assert_eq!(pool.busy_count(), 2);
        assert!(pool.claim(&"c".into()).is_none());

        pool.release(a);
        assert_eq!(pool.busy_count(), 1);
        assert!(pool.claim(&"c".into()).is_none());

        pool.release(b);
        assert_eq!(pool.busy_count(), 0);
        assert_eq!(pool.snapshots(Duration::from_secs(60)).len(), 1);
        assert!(pool.claim(&"c".into()).is_some());
    }

    #[test]
    fn growing_adds_idle_slots() {
        let mut pool = WorkerPool::new(1);
        pool.claim(&"a".into()).unwrap();
        pool.resize(3);
        assert_eq!(pool.idle_count(), 2);
        assert!(pool.claim(&"b".into()).is_some());
        assert!(pool.claim(&"c".into()).is_some());
        assert!(pool.claim(&"d".into()).is_none());
    }

    #[test]
    fn snapshots_report_idle_expiry() {
        let mut pool = WorkerPool::new(2);
        pool.claim(&"a".into()).unwrap();
        let snaps = pool.snapshots(Duration::ZERO);
        let busy = snaps.iter().find(|s| s.busy).unwrap();
        assert_eq!(busy.task_id, Some(TaskId::from("a")));
        assert!(busy.idle_for.is_none());
        assert!(!busy.idle_expired);

        let idle = snaps.iter().find(|s| !s.busy).unwrap();
        assert!(idle.idle_expired);
        assert_eq!(idle.tasks_run, 0);
    }
}
