use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ConfigUpdate, SchedulerConfig};
use crate::error::SchedulerError;
use crate::events::SchedulerEvent;
use crate::metrics::{SchedulerMetrics, TaskStatistics};
use crate::pool::WorkerSnapshot;
use crate::state::{Phase, SchedulerState, TaskLookup};
use crate::task::{TaskId, TaskResult, TaskSnapshot, TaskStatus};

/// The task scheduler. Cheap to clone; all clones share one state.
///
/// Tasks may be submitted before [`start`](Self::start); they wait in the
/// queue until the dispatcher runs.
#[derive(Clone)]
pub struct Scheduler {
    pub(super) inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) state: Mutex<SchedulerState>,
    /// Wakes the dispatcher early (new task, freed worker, requeue).
    pub(super) wake: Arc<Notify>,
    /// Signalled whenever a task reaches a terminal state.
    pub(super) settled: Notify,
    pub(super) dispatcher: Mutex<Option<Dispatcher>>,
}

pub(super) struct Dispatcher {
    pub(super) handle: JoinHandle<()>,
    pub(super) stop: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler. Fails if the configuration does not validate.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        info!(
            max_workers = config.resolved_max_workers(),
            max_queue_size = config.max_queue_size,
            retry = config.enable_retry,
            "task scheduler created"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::new(config)),
                wake: Arc::new(Notify::new()),
                settled: Notify::new(),
                dispatcher: Mutex::new(None),
            }),
        })
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.lock()
    }

    /// Whether the dispatcher is currently running.
    pub fn is_running(&self) -> bool {
        self.lock().phase == Phase::Running
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.lock().events.subscribe()
    }

    pub fn config(&self) -> SchedulerConfig {
        self.lock().config.clone()
    }

    /// Apply a partial configuration update.
    ///
    /// Pool size and queue capacity change immediately. Timeout and retry
    /// defaults only affect tasks submitted afterwards.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<SchedulerConfig, SchedulerError> {
        let mut state = self.lock();
        let mut config = state.config.clone();
        update.apply_to(&mut config);
        config.validate()?;

        info!(
            max_workers = config.resolved_max_workers(),
            max_queue_size = config.max_queue_size,
            "scheduler configuration updated"
        );
        state.apply_config(config.clone());
        drop(state);
        self.inner.wake.notify_one();
        Ok(config)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn metrics(&self) -> SchedulerMetrics {
        self.lock().metrics()
    }

    pub fn task_statistics(&self) -> TaskStatistics {
        self.lock().statistics()
    }

    /// Health view of every worker slot.
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.lock().workers()
    }

    pub fn get_task_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.lock().status_of(id)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.lock().snapshot(id)
    }

    pub fn get_task_result(&self, id: &TaskId) -> Option<TaskResult> {
        self.lock().result(id)
    }

    /// Find a task wherever it currently lives.
    pub fn lookup(&self, id: &TaskId) -> Result<TaskLookup, SchedulerError> {
        self.lock().lookup(id)
    }

    /// Drop finished tasks whose result is older than `older_than`.
    /// Returns how many were removed.
    pub fn cleanup_completed_tasks(&self, older_than: Duration) -> usize {
        let removed = self.lock().cleanup(older_than);
        if removed > 0 {
            info!(removed, "cleaned up finished tasks");
        }
        removed
    }
}

impl Inner {
    /// The state lock, recovering from poisoning. Never held across `.await`.
    pub(super) fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn dispatcher(&self) -> MutexGuard<'_, Option<Dispatcher>> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
