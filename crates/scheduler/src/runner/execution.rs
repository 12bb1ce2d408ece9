use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::state::{Launch, Phase};
use crate::task::{TaskId, TaskStatus};
use crate::work::{WorkError, WorkOutput};

use super::core::{Dispatcher, Inner};
use super::Scheduler;

type AttemptHandle = JoinHandle<Result<WorkOutput, WorkError>>;

impl Scheduler {
    /// Start the dispatch loop. Must be called from within a Tokio runtime.
    ///
    /// Has no effect while already running or shutting down. A stopped
    /// scheduler can be started again.
    pub fn start(&self) {
        let mut dispatcher = self.inner.dispatcher();
        {
            let mut state = self.lock();
            if !matches!(state.phase, Phase::Idle | Phase::Stopped) {
                debug!("task scheduler already running");
                return;
            }
            state.phase = Phase::Running;
            info!(
                workers = state.config.resolved_max_workers(),
                queued = state.metrics().queued_tasks,
                "task scheduler started"
            );
        }

        let stop = CancellationToken::new();
        let handle = tokio::spawn(dispatch_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.wake),
            stop.clone(),
        ));
        *dispatcher = Some(Dispatcher { handle, stop });
    }

    /// Stop the scheduler.
    ///
    /// Dispatch stops at once. Running tasks get `shutdown_grace_period_ms`
    /// to finish; whatever is still running afterwards is cancelled and
    /// aborted, and every task still waiting to run is cancelled. Calling it
    /// again, or on a scheduler that was never started, is harmless.
    pub async fn shutdown(&self) {
        let dispatcher = self.inner.dispatcher().take();
        {
            let mut state = self.lock();
            if matches!(state.phase, Phase::Stopping | Phase::Stopped) {
                return;
            }
            state.phase = Phase::Stopping;
            info!(running = state.running_count(), "task scheduler shutting down");
        }

        if let Some(Dispatcher { handle, stop }) = dispatcher {
            stop.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch loop ended abnormally");
            }
        }

        let grace = self.lock().config.shutdown_grace_period();
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().running_count() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let (aborted, cancelled) = {
            let mut state = self.lock();
            let aborted = state.abort_running();
            let cancelled = state.cancel_pending();
            state.phase = Phase::Stopped;
            (aborted, cancelled)
        };
        if aborted > 0 {
            warn!(aborted, grace = ?grace, "force-cancelled tasks still running after grace period");
        }
        self.inner.settled.notify_waiters();
        info!(cancelled_pending = cancelled, "task scheduler stopped");
    }

    /// One dispatch pass. Returns how long to sleep before the next one.
    fn dispatch_tick(&self) -> Duration {
        let mut state = self.lock();
        let interval = state.config.dispatch_interval();
        if state.phase != Phase::Running {
            return interval;
        }

        let failed = state.fail_unrunnable();

        for Launch {
            task_id,
            work,
            ctx,
            timeout,
        } in state.claim_eligible()
        {
            let attempt = ctx.attempt;
            let cancel = ctx.cancel.clone();
            let handle: AttemptHandle = tokio::spawn(async move { work.execute(ctx).await });
            state.set_abort_handle(&task_id, handle.abort_handle());
            tokio::spawn(self.clone().supervise(task_id, attempt, handle, timeout, cancel));
        }

        state.heartbeat();
        drop(state);

        if failed > 0 {
            self.inner.settled.notify_waiters();
        }
        interval
    }

    /// Race one attempt against its timeout and cancellation, then record
    /// the outcome.
    async fn supervise(
        self,
        task_id: TaskId,
        attempt: u32,
        mut handle: AttemptHandle,
        timeout: Duration,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                // Bookkeeping was done by whoever cancelled.
                handle.abort();
                return;
            }
            res = tokio::time::timeout(timeout, &mut handle) => match res {
                Ok(Ok(Ok(output))) if output.is_success() => Ok(output),
                Ok(Ok(Ok(output))) => Err(SchedulerError::Execution(output.error_message())),
                Ok(Ok(Err(e))) => Err(SchedulerError::Execution(e.to_string())),
                Ok(Err(e)) if e.is_panic() => {
                    Err(SchedulerError::Execution("unit of work panicked".into()))
                }
                Ok(Err(_)) => Err(SchedulerError::Cancelled),
                Err(_) => {
                    handle.abort();
                    Err(SchedulerError::Timeout(timeout))
                }
            },
        };
        self.finish_attempt(&task_id, attempt, outcome, started.elapsed());
    }

    fn finish_attempt(
        &self,
        id: &TaskId,
        attempt: u32,
        outcome: Result<WorkOutput, SchedulerError>,
        elapsed: Duration,
    ) {
        let retry_in = {
            let mut state = self.lock();
            if state.take_attempt(id, attempt).is_none() {
                debug!(task_id = %id, attempt, "discarding outcome of abandoned attempt");
                return;
            }
            match outcome {
                Ok(output) => {
                    debug!(task_id = %id, elapsed = ?elapsed, "task completed");
                    state.finalize(id, TaskStatus::Completed, Some(output), None, elapsed);
                    None
                }
                Err(error) => {
                    let delay = state.begin_retry(id, &error);
                    if delay.is_none() {
                        warn!(task_id = %id, error = %error, "task failed");
                        state.finalize(id, TaskStatus::Failed, None, Some(&error), elapsed);
                    }
                    delay
                }
            }
        };

        if let Some(delay) = retry_in {
            let inner = Arc::downgrade(&self.inner);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = inner.upgrade() {
                    inner.lock().requeue(&id);
                    inner.wake.notify_one();
                    inner.settled.notify_waiters();
                }
            });
        }

        self.inner.wake.notify_one();
        self.inner.settled.notify_waiters();
    }
}

/// Runs dispatch ticks until stopped or every scheduler handle is dropped.
async fn dispatch_loop(inner: Weak<Inner>, wake: Arc<Notify>, stop: CancellationToken) {
    debug!("dispatch loop started");
    loop {
        let interval = match inner.upgrade() {
            Some(inner) => Scheduler { inner }.dispatch_tick(),
            None => break,
        };
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("dispatch loop exited");
}
