//! The scheduler's single owned state object.
//!
//! Queue, running set, result stores and task records all live here behind
//! one lock held by [`Scheduler`](crate::Scheduler). Every mutation goes
//! through a method on [`SchedulerState`]; nothing hands out references to
//! the containers themselves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{RetryPolicy, SchedulerConfig};
use crate::error::{SchedulerError, TaskFailure};
use crate::events::{EventBus, SchedulerEvent};
use crate::metrics::{DurationSummary, SchedulerMetrics, TaskStatistics};
use crate::pool::WorkerPool;
use crate::queue::PriorityQueue;
use crate::resolver::{self, DependencyResolver, DependencyState};
use crate::store::ResultStore;
use crate::task::{TaskId, TaskOptions, TaskRecord, TaskResult, TaskSnapshot, TaskStatus};
use crate::work::{UnitOfWork, WorkContext, WorkOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Created, dispatcher not started yet. Submissions queue up.
    Idle,
    Running,
    /// Shutdown in progress: no new dispatches, running work may finish.
    Stopping,
    Stopped,
}

/// Bookkeeping for an attempt currently holding a worker slot.
pub(crate) struct RunningAttempt {
    pub worker_id: usize,
    pub attempt: u32,
    pub started: Instant,
    pub cancel: CancellationToken,
    pub abort: Option<AbortHandle>,
}

/// Everything needed to launch one attempt outside the lock.
pub(crate) struct Launch {
    pub task_id: TaskId,
    pub work: Arc<dyn UnitOfWork>,
    pub ctx: WorkContext,
    pub timeout: Duration,
}

/// Answer to a lookup by id, checked in running → completed → failed →
/// queued order.
#[derive(Debug, Clone)]
pub enum TaskLookup {
    Running(TaskSnapshot),
    Finished(TaskResult),
    Queued(TaskSnapshot),
}

pub(crate) struct SchedulerState {
    pub config: SchedulerConfig,
    pub phase: Phase,
    pub events: EventBus,
    tasks: HashMap<TaskId, TaskRecord>,
    queue: PriorityQueue,
    resolver: DependencyResolver,
    pool: WorkerPool,
    running: HashMap<TaskId, RunningAttempt>,
    /// Tasks waiting out a retry delay before re-entering the queue.
    backoff: HashSet<TaskId>,
    results: ResultStore,
    total_scheduled: u64,
    total_retries: u64,
    last_heartbeat: Instant,
}

impl SchedulerState {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            events: EventBus::new(config.event_buffer),
            queue: PriorityQueue::new(config.max_queue_size),
            pool: WorkerPool::new(config.resolved_max_workers()),
            config,
            phase: Phase::Idle,
            tasks: HashMap::new(),
            resolver: DependencyResolver::new(),
            running: HashMap::new(),
            backoff: HashSet::new(),
            results: ResultStore::new(),
            total_scheduled: 0,
            total_retries: 0,
            last_heartbeat: Instant::now(),
        }
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Build a record from options, filling unset fields from config.
    fn prepare(
        &self,
        work: Arc<dyn UnitOfWork>,
        options: TaskOptions,
    ) -> Result<TaskRecord, SchedulerError> {
        let id = options.id.unwrap_or_else(TaskId::generate);
        if let Some(existing) = self.tasks.get(&id) {
            if !existing.status.is_terminal() {
                return Err(SchedulerError::DuplicateTask(id));
            }
        }

        let defaults = self.config.retry_policy();
        let multiplier = options.backoff_multiplier.unwrap_or(defaults.multiplier);
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "task '{id}': backoff_multiplier must be >= 1.0, got {multiplier}"
            )));
        }
        let retry = RetryPolicy {
            enabled: defaults.enabled,
            max_retries: options.max_retries.unwrap_or(defaults.max_retries),
            base_delay: options.retry_delay.unwrap_or(defaults.base_delay),
            multiplier,
            max_delay: defaults.max_delay,
        };
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.worker_timeout())
            .min(self.config.max_task_execution_time());

        let now = Utc::now();
        Ok(TaskRecord {
            name: options.name.unwrap_or_else(|| work.name().to_string()),
            id,
            work,
            priority: options.priority,
            dependencies: options.dependencies,
            timeout,
            retry,
            retry_count: 0,
            attempt: 0,
            status: TaskStatus::Pending,
            created_at: now,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    fn enqueue(&mut self, record: TaskRecord) -> Result<TaskId, SchedulerError> {
        let id = record.id.clone();
        if let Err(e) = self
            .queue
            .insert(id.clone(), record.priority, record.dependencies.clone())
        {
            warn!(task_id = %id, capacity = self.queue.capacity(), "task queue full, rejecting task");
            self.events.emit(SchedulerEvent::QueueFull {
                task_id: Some(id),
                capacity: self.queue.capacity(),
            });
            return Err(e);
        }

        // A terminal task with the same id is being replaced.
        self.results.remove(&id);
        let priority = record.priority;
        debug!(task_id = %id, name = %record.name, priority = priority.0, "task scheduled");
        self.tasks.insert(id.clone(), record);
        self.total_scheduled += 1;
        self.events.emit(SchedulerEvent::TaskScheduled {
            task_id: id.clone(),
            priority,
        });
        Ok(id)
    }

    pub fn admit(
        &mut self,
        work: Arc<dyn UnitOfWork>,
        options: TaskOptions,
    ) -> Result<TaskId, SchedulerError> {
        let record = self.prepare(work, options)?;
        self.enqueue(record)
    }

    /// All-or-nothing submission of several tasks.
    pub fn admit_batch(
        &mut self,
        items: Vec<(Arc<dyn UnitOfWork>, TaskOptions)>,
    ) -> Result<Vec<TaskId>, SchedulerError> {
        let mut records = Vec::with_capacity(items.len());
        let mut seen = HashSet::new();
        for (work, options) in items {
            let record = self.prepare(work, options)?;
            if !seen.insert(record.id.clone()) {
                return Err(SchedulerError::DuplicateTask(record.id));
            }
            records.push(record);
        }

        if records.len() > self.queue.available() {
            warn!(
                batch = records.len(),
                available = self.queue.available(),
                "task queue cannot hold batch, rejecting"
            );
            self.events.emit(SchedulerEvent::QueueFull {
                task_id: None,
                capacity: self.queue.capacity(),
            });
            return Err(SchedulerError::QueueFull {
                capacity: self.queue.capacity(),
            });
        }

        records.into_iter().map(|r| self.enqueue(r)).collect()
    }

    // ── Terminal transitions ────────────────────────────────────────

    /// Move a task to a terminal state, store its result and emit the
    /// matching event.
    pub fn finalize(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        output: Option<WorkOutput>,
        error: Option<&SchedulerError>,
        execution_time: Duration,
    ) -> Option<TaskResult> {
        let record = self.tasks.get_mut(id)?;
        let now = Utc::now();
        record.status = status;
        record.completed_at = Some(now);

        let result = TaskResult {
            task_id: id.clone(),
            status,
            output,
            error: error.map(TaskFailure::from),
            execution_time,
            retry_count: record.retry_count,
            completed_at: now,
        };
        self.results.insert(result.clone());

        let event = match status {
            TaskStatus::Completed => SchedulerEvent::TaskCompleted {
                task_id: id.clone(),
                execution_time,
                retry_count: result.retry_count,
            },
            TaskStatus::Cancelled => SchedulerEvent::TaskCancelled { task_id: id.clone() },
            _ => SchedulerEvent::TaskFailed {
                task_id: id.clone(),
                error: result.error.clone().unwrap_or_else(|| TaskFailure {
                    kind: crate::error::ErrorKind::Other,
                    message: "task failed".into(),
                }),
                retry_count: result.retry_count,
            },
        };
        self.events.emit(event);
        Some(result)
    }

    /// Fail a task that is still in the queue without running it.
    fn fail_queued(&mut self, id: &TaskId, error: SchedulerError) {
        self.queue.remove(id);
        warn!(task_id = %id, error = %error, "task failed before dispatch");
        self.finalize(id, TaskStatus::Failed, None, Some(&error), Duration::ZERO);
    }

    /// Release the worker slot held by a running attempt.
    fn release_worker(&mut self, worker_id: usize) {
        if self.pool.release(worker_id) {
            self.events
                .emit(SchedulerEvent::WorkerAvailable { worker_id });
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Fail queued tasks that can never run: members of a dependency cycle
    /// and tasks whose dependency failed or was cancelled. Tasks naming an
    /// unknown dependency stay queued.
    /// Returns how many tasks were failed.
    pub fn fail_unrunnable(&mut self) -> usize {
        let mut failed = 0;
        for cycle in self.resolver.detect_cycles(&self.queue) {
            let path = resolver::format_cycle(&cycle);
            for id in &cycle {
                if self.queue.contains(id) {
                    self.fail_queued(id, SchedulerError::CircularDependency(path.clone()));
                    failed += 1;
                }
            }
        }

        let blocked: Vec<(TaskId, SchedulerError)> = self
            .queue
            .iter()
            .filter_map(|entry| {
                let state = resolver::dependency_state(&entry.dependencies, |dep| {
                    self.tasks.get(dep).map(|r| r.status)
                });
                match state {
                    DependencyState::Failed { dependency, status } => Some((
                        entry.id.clone(),
                        SchedulerError::DependencyFailed {
                            task: entry.id.clone(),
                            dependency,
                            status,
                        },
                    )),
                    DependencyState::Ready
                    | DependencyState::Waiting
                    | DependencyState::Missing(_) => None,
                }
            })
            .collect();

        failed += blocked.len();
        for (id, error) in blocked {
            self.fail_queued(&id, error);
        }
        failed
    }

    /// Fail every queued task in `id`'s dependency closure (itself included)
    /// that names a dependency no task in the scheduler has. Called when a
    /// caller starts waiting on `id`; dependents of a failed task are then
    /// failed by the next [`fail_unrunnable`](Self::fail_unrunnable).
    pub fn fail_missing_dependencies(&mut self, id: &TaskId) -> usize {
        let mut missing = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![id.clone()];

        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) || !self.queue.contains(&current) {
                continue;
            }
            let Some(record) = self.tasks.get(&current) else {
                continue;
            };
            match record.dependencies.iter().find(|dep| !self.tasks.contains_key(*dep)) {
                Some(dependency) => missing.push((current.clone(), dependency.clone())),
                None => stack.extend(record.dependencies.iter().cloned()),
            }
        }

        let failed = missing.len();
        for (task, dependency) in missing {
            let error = SchedulerError::DependencyNotFound {
                task: task.clone(),
                dependency,
            };
            self.fail_queued(&task, error);
        }
        failed
    }

    /// Pair eligible tasks with idle workers, in priority order, and mark
    /// them running. The caller spawns the returned launches.
    pub fn claim_eligible(&mut self) -> Vec<Launch> {
        let completed: HashSet<TaskId> = self
            .tasks
            .values()
            .filter(|r| r.status == TaskStatus::Completed)
            .map(|r| r.id.clone())
            .collect();
        let running: HashSet<TaskId> = self.running.keys().cloned().collect();

        let mut launches = Vec::new();
        for id in resolver::eligible_tasks(&self.queue, &completed, &running) {
            let Some(worker_id) = self.pool.claim(&id) else {
                break;
            };
            self.queue.remove(&id);

            let Some(record) = self.tasks.get_mut(&id) else {
                self.pool.release(worker_id);
                continue;
            };
            record.status = TaskStatus::Running;
            record.started_at = Some(Utc::now());
            record.attempt += 1;
            let attempt = record.attempt;

            let cancel = CancellationToken::new();
            launches.push(Launch {
                task_id: id.clone(),
                work: Arc::clone(&record.work),
                ctx: WorkContext {
                    task_id: id.clone(),
                    attempt,
                    cancel: cancel.clone(),
                },
                timeout: record.timeout,
            });
            self.running.insert(
                id.clone(),
                RunningAttempt {
                    worker_id,
                    attempt,
                    started: Instant::now(),
                    cancel,
                    abort: None,
                },
            );

            debug!(task_id = %id, worker = worker_id, attempt, "task started");
            self.events.emit(SchedulerEvent::WorkerBusy {
                worker_id,
                task_id: id.clone(),
            });
            self.events.emit(SchedulerEvent::TaskStarted {
                task_id: id,
                worker_id,
                attempt,
            });
        }
        launches
    }

    pub fn set_abort_handle(&mut self, id: &TaskId, handle: AbortHandle) {
        if let Some(running) = self.running.get_mut(id) {
            running.abort = Some(handle);
        }
    }

    // ── Attempt outcomes ────────────────────────────────────────────

    /// Take the running entry for `id` if it still belongs to `attempt`.
    /// A mismatch means the attempt was cancelled or abandoned.
    pub fn take_attempt(&mut self, id: &TaskId, attempt: u32) -> Option<RunningAttempt> {
        if self.running.get(id).map(|r| r.attempt) != Some(attempt) {
            return None;
        }
        let running = self.running.remove(id)?;
        self.release_worker(running.worker_id);
        Some(running)
    }

    /// Decide whether a failed attempt gets another try. On retry, the task
    /// goes back to `Pending` and into the backoff set; the returned delay is
    /// how long to wait before requeueing.
    pub fn begin_retry(&mut self, id: &TaskId, error: &SchedulerError) -> Option<Duration> {
        if !error.is_retryable() || !matches!(self.phase, Phase::Running) {
            return None;
        }
        let record = self.tasks.get_mut(id)?;
        if !record.retry.allows_retry(record.retry_count) {
            return None;
        }
        record.retry_count += 1;
        record.status = TaskStatus::Pending;
        let retry_count = record.retry_count;
        let delay = record.retry.delay_for(retry_count);

        self.total_retries += 1;
        self.backoff.insert(id.clone());
        warn!(task_id = %id, retry = retry_count, delay = ?delay, error = %error, "task attempt failed, retrying");
        self.events.emit(SchedulerEvent::TaskRetry {
            task_id: id.clone(),
            retry_count,
            delay,
            error: error.to_string(),
        });
        Some(delay)
    }

    /// Put a task back into the queue after its backoff delay.
    pub fn requeue(&mut self, id: &TaskId) {
        if !self.backoff.remove(id) {
            // cancelled or shut down while waiting
            return;
        }
        let Some(record) = self.tasks.get(id) else {
            return;
        };
        let (priority, deps) = (record.priority, record.dependencies.clone());
        if let Err(error) = self.queue.insert(id.clone(), priority, deps) {
            warn!(task_id = %id, "task queue full, cannot requeue retried task");
            self.events.emit(SchedulerEvent::QueueFull {
                task_id: Some(id.clone()),
                capacity: self.queue.capacity(),
            });
            self.finalize(id, TaskStatus::Failed, None, Some(&error), Duration::ZERO);
        }
    }

    // ── Cancellation ────────────────────────────────────────────────

    pub fn cancel(&mut self, id: &TaskId, reason: &str) -> CancelOutcome {
        let Some(record) = self.tasks.get(id) else {
            return CancelOutcome::NotFound;
        };
        if record.status.is_terminal() {
            return CancelOutcome::AlreadyFinished;
        }

        let execution_time = if self.queue.remove(id).is_some() || self.backoff.remove(id) {
            Duration::ZERO
        } else if let Some(running) = self.running.remove(id) {
            running.cancel.cancel();
            self.release_worker(running.worker_id);
            running.started.elapsed()
        } else {
            Duration::ZERO
        };

        debug!(task_id = %id, reason, "task cancelled");
        self.finalize(
            id,
            TaskStatus::Cancelled,
            None,
            Some(&SchedulerError::Cancelled),
            execution_time,
        );
        CancelOutcome::Cancelled
    }

    /// Force-cancel every running attempt, aborting its future.
    pub fn abort_running(&mut self) -> usize {
        let ids: Vec<TaskId> = self.running.keys().cloned().collect();
        for id in &ids {
            if let Some(running) = self.running.get_mut(id) {
                if let Some(handle) = running.abort.take() {
                    handle.abort();
                }
            }
            warn!(task_id = %id, "force-cancelling task at shutdown");
            self.cancel(id, "shutdown grace period elapsed");
        }
        ids.len()
    }

    /// Cancel everything still waiting to run.
    pub fn cancel_pending(&mut self) -> usize {
        let mut ids: Vec<TaskId> = self.queue.iter().map(|e| e.id.clone()).collect();
        ids.extend(self.backoff.iter().cloned());
        for id in &ids {
            self.cancel(id, "scheduler shut down");
        }
        ids.len()
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|r| r.status)
    }

    pub fn snapshot(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.tasks.get(id).map(TaskRecord::snapshot)
    }

    pub fn result(&self, id: &TaskId) -> Option<TaskResult> {
        self.results.get(id).cloned()
    }

    pub fn lookup(&self, id: &TaskId) -> Result<TaskLookup, SchedulerError> {
        if self.running.contains_key(id) {
            if let Some(snapshot) = self.snapshot(id) {
                return Ok(TaskLookup::Running(snapshot));
            }
        }
        if let Some(result) = self.results.completed(id).or_else(|| self.results.failed(id)) {
            return Ok(TaskLookup::Finished(result.clone()));
        }
        if self.queue.contains(id) || self.backoff.contains(id) {
            if let Some(snapshot) = self.snapshot(id) {
                return Ok(TaskLookup::Queued(snapshot));
            }
        }
        Err(SchedulerError::NotFound(id.clone()))
    }

    pub fn workers(&self) -> Vec<crate::pool::WorkerSnapshot> {
        self.pool.snapshots(self.config.worker_idle_timeout())
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let average = DurationSummary::from_durations(
            self.results.iter_completed().map(|r| r.execution_time),
        )
        .mean;
        SchedulerMetrics {
            pending_tasks: self.queue.len() + self.backoff.len(),
            running_tasks: self.running.len(),
            completed_tasks: self.results.count_with_status(TaskStatus::Completed),
            failed_tasks: self.results.count_with_status(TaskStatus::Failed),
            cancelled_tasks: self.results.count_with_status(TaskStatus::Cancelled),
            total_scheduled: self.total_scheduled,
            total_retries: self.total_retries,
            average_execution_time: average,
            busy_workers: self.pool.busy_count(),
            total_workers: self.pool.size(),
            worker_utilization: self.pool.utilization(),
            queued_tasks: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            queue_utilization: self.queue.utilization(),
        }
    }

    pub fn statistics(&self) -> TaskStatistics {
        let mut stats = TaskStatistics {
            total_tasks: self.tasks.len(),
            ..Default::default()
        };
        for record in self.tasks.values() {
            stats.total_retries += u64::from(record.retry_count);
            match record.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        for result in self.results.iter() {
            if result.status == TaskStatus::Completed {
                stats.execution_time.record(result.execution_time);
            }
            if result.status == TaskStatus::Failed {
                if let Some(error) = &result.error {
                    *stats.failures_by_kind.entry(error.kind).or_default() += 1;
                }
            }
        }
        stats.finish()
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Drop terminal tasks whose result is older than `older_than`.
    pub fn cleanup(&mut self, older_than: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let removed = self.results.prune_before(Utc::now() - age);
        for id in &removed {
            self.tasks.remove(id);
        }
        removed.len()
    }

    pub fn apply_config(&mut self, config: SchedulerConfig) {
        self.pool.resize(config.resolved_max_workers());
        self.queue.set_capacity(config.max_queue_size);
        self.config = config;
    }

    /// Log a pool health line if the heartbeat interval has elapsed.
    pub fn heartbeat(&mut self) {
        if self.last_heartbeat.elapsed() < self.config.worker_heartbeat_interval() {
            return;
        }
        self.last_heartbeat = Instant::now();
        let workers = self.workers();
        let expired = workers.iter().filter(|w| w.idle_expired).count();
        debug!(
            busy = self.pool.busy_count(),
            total = self.pool.size(),
            idle_expired = expired,
            queued = self.queue.len(),
            backoff = self.backoff.len(),
            "worker pool heartbeat"
        );
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was pending or running and is now `Cancelled`.
    Cancelled,
    /// The task had already reached a terminal state.
    AlreadyFinished,
    NotFound,
}
