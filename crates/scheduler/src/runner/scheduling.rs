use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use crate::error::SchedulerError;
use crate::state::CancelOutcome;
use crate::task::{TaskId, TaskOptions, TaskResult};
use crate::work::{work_fn, UnitOfWork, WorkContext, WorkError, WorkOutput};

use super::Scheduler;

impl Scheduler {
    /// Submit a unit of work.
    ///
    /// Returns the task id (supplied or generated). Fails synchronously with
    /// [`SchedulerError::QueueFull`] when the queue is at capacity and with
    /// [`SchedulerError::DuplicateTask`] when the id belongs to a task that
    /// has not finished. Unknown dependency ids are accepted: the task waits
    /// for them to be submitted until someone calls
    /// [`execute_task`](Self::execute_task) on it.
    pub fn schedule_task(
        &self,
        work: Arc<dyn UnitOfWork>,
        options: TaskOptions,
    ) -> Result<TaskId, SchedulerError> {
        let id = self.lock().admit(work, options)?;
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Submit several tasks atomically. Either all are queued or none is.
    pub fn schedule_batch(
        &self,
        tasks: Vec<(Arc<dyn UnitOfWork>, TaskOptions)>,
    ) -> Result<Vec<TaskId>, SchedulerError> {
        let ids = self.lock().admit_batch(tasks)?;
        self.inner.wake.notify_one();
        Ok(ids)
    }

    /// Submit an async closure with default options.
    pub fn schedule_fn<F, Fut>(&self, name: &str, f: F) -> Result<TaskId, SchedulerError>
    where
        F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkOutput, WorkError>> + Send + 'static,
    {
        self.schedule_task(work_fn(name, f), TaskOptions::new().name(name))
    }

    /// Cancel a task, reporting what happened.
    ///
    /// A running task is marked `Cancelled` and its worker freed at once.
    /// Its cancellation token fires and the attempt future is dropped at its
    /// next await point; side effects already started are not rolled back.
    pub fn cancel(&self, id: &TaskId) -> CancelOutcome {
        let outcome = self.lock().cancel(id, "cancel requested");
        if outcome == CancelOutcome::Cancelled {
            self.inner.wake.notify_one();
            self.inner.settled.notify_waiters();
        }
        outcome
    }

    /// Cancel a task. True only if this call moved it to `Cancelled`.
    pub fn cancel_task(&self, id: &TaskId) -> bool {
        self.cancel(id) == CancelOutcome::Cancelled
    }

    /// Wait until a task reaches a terminal state and return its result.
    ///
    /// Queued tasks in the dependency closure of `id` that still name an
    /// unknown dependency fail with [`SchedulerError::DependencyNotFound`]
    /// when the wait begins.
    ///
    /// The wait is bounded by `execute_wait_timeout_ms`; a task stuck behind
    /// a dependency that never finishes yields [`SchedulerError::WaitTimeout`]
    /// and keeps its place in the queue.
    pub async fn execute_task(&self, id: &TaskId) -> Result<TaskResult, SchedulerError> {
        let (failed, waited) = {
            let mut state = self.lock();
            let failed = state.fail_missing_dependencies(id);
            if failed > 0 {
                state.fail_unrunnable();
            }
            (failed, state.config.execute_wait_timeout())
        };
        if failed > 0 {
            debug!(task_id = %id, failed, "failed tasks with unknown dependencies");
            self.inner.wake.notify_one();
        }
        let deadline = Instant::now() + waited;

        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not lost.
            notified.as_mut().enable();

            {
                let state = self.lock();
                match state.status_of(id) {
                    None => return Err(SchedulerError::NotFound(id.clone())),
                    Some(status) if status.is_terminal() => {
                        return state
                            .result(id)
                            .ok_or_else(|| SchedulerError::NotFound(id.clone()));
                    }
                    Some(_) => {}
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(task_id = %id, waited = ?waited, "gave up waiting for task");
                return Err(SchedulerError::WaitTimeout {
                    task: id.clone(),
                    waited,
                });
            }
        }
    }

    /// Schedule a unit of work and wait for its result.
    pub async fn run(
        &self,
        work: Arc<dyn UnitOfWork>,
        options: TaskOptions,
    ) -> Result<TaskResult, SchedulerError> {
        let id = self.schedule_task(work, options)?;
        self.execute_task(&id).await
    }
}
