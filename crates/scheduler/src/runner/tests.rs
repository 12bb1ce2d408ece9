#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::config::{ConfigUpdate, SchedulerConfig};
    use crate::error::{ErrorKind, SchedulerError};
    use crate::runner::Scheduler;
    use crate::state::{CancelOutcome, TaskLookup};
    use crate::task::{TaskId, TaskOptions, TaskStatus};
    use crate::work::{UnitOfWork, WorkContext, WorkError, WorkOutput};

    /// Mock unit of work that sleeps, then fails a fixed number of times
    /// before succeeding.
    struct MockWork {
        name: String,
        delay: Duration,
        failures: usize,
        execute_count: Arc<AtomicUsize>,
    }

    impl MockWork {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                delay: Duration::from_millis(5),
                failures: 0,
                execute_count: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn taking(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self, times: usize) -> Self {
            self.failures = times;
            self
        }

        fn counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.execute_count)
        }
    }

    #[async_trait]
    impl UnitOfWork for MockWork {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, _ctx: WorkContext) -> Result<WorkOutput, WorkError> {
            let run = self.execute_count.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if run < self.failures {
                return Err(WorkError::Failed(format!("{} failed on run {}", self.name, run + 1)));
            }
            Ok(WorkOutput::success(json!({ "tool": self.name })))
        }
    }

    /// Waits for cancellation and reports it.
    struct CooperativeWork;

    #[async_trait]
    impl UnitOfWork for CooperativeWork {
        fn name(&self) -> &str {
            "cooperative"
        }

        async fn execute(&self, ctx: WorkContext) -> Result<WorkOutput, WorkError> {
            ctx.cancelled().await;
            Err(WorkError::Cancelled)
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            max_workers: 2,
            dispatch_interval_ms: 5,
            retry_delay_ms: 5,
            shutdown_grace_period_ms: 200,
            execute_wait_timeout_ms: 5_000,
            ..Default::default()
        }
    }

    fn opts(id: &str) -> TaskOptions {
        TaskOptions::new().id(id)
    }

    #[test]
    fn scheduler_creation() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        let metrics = scheduler.metrics();
        assert_eq!(metrics.total_workers, 2);
        assert_eq!(metrics.pending_tasks, 0);
        assert_eq!(metrics.queue_capacity, 1000);
        assert!(!scheduler.is_running());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SchedulerConfig {
            max_queue_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            Scheduler::new(config),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn tasks_wait_in_queue_until_started() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        let id = scheduler
            .schedule_task(Arc::new(MockWork::new("lint")), opts("lint"))
            .unwrap();

        assert_eq!(scheduler.get_task_status(&id), Some(TaskStatus::Pending));
        assert!(matches!(scheduler.lookup(&id), Ok(TaskLookup::Queued(_))));
        assert_eq!(scheduler.metrics().queued_tasks, 1);
        assert!(scheduler.get_task_result(&id).is_none());
    }

    #[test]
    fn generated_ids_when_none_given() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        let id = scheduler
            .schedule_task(Arc::new(MockWork::new("lint")), TaskOptions::new())
            .unwrap();
        assert!(uuid::Uuid::parse_str(id.as_str()).is_ok());
        assert_eq!(scheduler.get_task(&id).unwrap().name, "lint");
    }

    #[test]
    fn duplicate_live_id_is_rejected() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        scheduler
            .schedule_task(Arc::new(MockWork::new("lint")), opts("lint"))
            .unwrap();
        let err = scheduler
            .schedule_task(Arc::new(MockWork::new("lint")), opts("lint"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask(_)));
    }

    #[test]
    fn full_queue_rejects_and_emits_event() {
        let config = SchedulerConfig {
            max_queue_size: 2,
            ..fast_config()
        };
        let scheduler = Scheduler::new(config).unwrap();
        let mut events = scheduler.subscribe();

        for name in ["a", "b"] {
            scheduler
                .schedule_task(Arc::new(MockWork::new(name)), opts(name))
                .unwrap();
        }
        let err = scheduler
            .schedule_task(Arc::new(MockWork::new("c")), opts("c"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull { capacity: 2 }));
        assert!(scheduler.get_task_status(&"c".into()).is_none());

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["task:scheduled", "task:scheduled", "queue:full"]);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let config = SchedulerConfig {
            max_queue_size: 2,
            ..fast_config()
        };
        let scheduler = Scheduler::new(config).unwrap();
        let batch = |names: &[&str]| {
            names
                .iter()
                .map(|n| {
                    let work: Arc<dyn UnitOfWork> = Arc::new(MockWork::new(n));
                    (work, opts(n))
                })
                .collect::<Vec<_>>()
        };

        assert!(scheduler.schedule_batch(batch(&["a", "b", "c"])).is_err());
        assert_eq!(scheduler.metrics().queued_tasks, 0);

        let ids = scheduler.schedule_batch(batch(&["a", "b"])).unwrap();
        assert_eq!(ids, vec![TaskId::from("a"), TaskId::from("b")]);
    }

    #[test]
    fn cancel_queued_task_is_idempotent() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        let id = scheduler
            .schedule_task(Arc::new(MockWork::new("fmt")), opts("fmt"))
            .unwrap();

        assert_eq!(scheduler.cancel(&id), CancelOutcome::Cancelled);
        assert_eq!(scheduler.get_task_status(&id), Some(TaskStatus::Cancelled));
        assert_eq!(scheduler.cancel(&id), CancelOutcome::AlreadyFinished);
        assert_eq!(scheduler.cancel(&"ghost".into()), CancelOutcome::NotFound);
        assert!(!scheduler.cancel_task(&id));
        assert_eq!(scheduler.metrics().cancelled_tasks, 1);
    }

    #[test]
    fn update_config_resizes_pool_and_queue() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        let updated = scheduler
            .update_config(ConfigUpdate {
                max_workers: Some(6),
                max_queue_size: Some(10),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.max_workers, 6);
        let metrics = scheduler.metrics();
        assert_eq!(metrics.total_workers, 6);
        assert_eq!(metrics.queue_capacity, 10);

        let err = scheduler.update_config(ConfigUpdate {
            backoff_multiplier: Some(0.5),
            ..Default::default()
        });
        assert!(err.is_err());
        assert_eq!(scheduler.config().backoff_multiplier, 2.0);
    }

    #[tokio::test]
    async fn completes_task_and_stores_output() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        scheduler.start();

        let work = MockWork::new("lint");
        let count = work.counter();
        let result = scheduler.run(Arc::new(work), opts("lint")).await.unwrap();

        assert!(result.is_success());
        assert_eq!(result.retry_count, 0);
        assert_eq!(result.output.unwrap().payload["tool"], "lint");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(
            scheduler.lookup(&"lint".into()),
            Ok(TaskLookup::Finished(_))
        ));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_dependency_fails_once_awaited() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        scheduler.start();

        scheduler
            .schedule_task(Arc::new(MockWork::new("mid")), opts("mid").depends_on("ghost"))
            .unwrap();
        scheduler
            .schedule_task(Arc::new(MockWork::new("top")), opts("top").depends_on("mid"))
            .unwrap();

        // nobody is waiting yet, so both stay queued
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(scheduler.get_task_status(&"mid".into()), Some(TaskStatus::Pending));
        assert_eq!(scheduler.get_task_status(&"top".into()), Some(TaskStatus::Pending));

        let top = scheduler.execute_task(&"top".into()).await.unwrap();
        assert_eq!(top.status, TaskStatus::Failed);
        assert_eq!(top.error.unwrap().kind, ErrorKind::DependencyFailed);

        let mid = scheduler.get_task_result(&"mid".into()).unwrap();
        assert_eq!(mid.status, TaskStatus::Failed);
        assert_eq!(mid.retry_count, 0);
        assert_eq!(mid.error.unwrap().kind, ErrorKind::DependencyNotFound);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        scheduler.start();

        let work = MockWork::new("flaky").failing(2);
        let count = work.counter();
        let result = scheduler
            .run(Arc::new(work), opts("flaky").max_retries(3))
            .await
            .unwrap();

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.retry_count, 2);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.metrics().total_retries, 2);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_retry_fails_on_first_error() {
        let config = SchedulerConfig {
            enable_retry: false,
            ..fast_config()
        };
        let scheduler = Scheduler::new(config).unwrap();
        scheduler.start();

        let work = MockWork::new("broken").failing(5);
        let count = work.counter();
        let result = scheduler
            .run(Arc::new(work), opts("broken").max_retries(3))
            .await
            .unwrap();

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.retry_count, 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(result.error_message().unwrap().contains("broken failed"));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn error_status_output_counts_as_failure() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        scheduler.start();

        let id = scheduler
            .schedule_task(
                crate::work::work_fn("tsc", |_ctx| async {
                    Ok(WorkOutput::error(json!({ "error": "3 type errors" })))
                }),
                opts("tsc").max_retries(0),
            )
            .unwrap();
        let result = scheduler.execute_task(&id).await.unwrap();

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Execution);
        assert_eq!(result.error_message(), Some("execution failed: 3 type errors"));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_running_task_frees_worker() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        scheduler.start();

        let id = scheduler
            .schedule_task(Arc::new(CooperativeWork), opts("watch"))
            .unwrap();
        for _ in 0..100 {
            if scheduler.get_task_status(&id) == Some(TaskStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(scheduler.metrics().busy_workers, 1);

        assert!(scheduler.cancel_task(&id));
        assert_eq!(scheduler.get_task_status(&id), Some(TaskStatus::Cancelled));
        assert_eq!(scheduler.metrics().busy_workers, 0);

        let result = scheduler.execute_task(&id).await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Cancelled);

        // the late outcome of the cancelled attempt is discarded
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.get_task_status(&id), Some(TaskStatus::Cancelled));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn execute_task_wait_is_bounded() {
        let config = SchedulerConfig {
            execute_wait_timeout_ms: 30,
            ..fast_config()
        };
        let scheduler = Scheduler::new(config).unwrap();
        // never started: the task stays queued
        let id = scheduler
            .schedule_task(Arc::new(MockWork::new("lint")), opts("lint"))
            .unwrap();

        let err = scheduler.execute_task(&id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::WaitTimeout { .. }));
        assert_eq!(scheduler.get_task_status(&id), Some(TaskStatus::Pending));

        let err = scheduler.execute_task(&"ghost".into()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }

    #[tokio::test]
    async fn shutdown_force_cancels_after_grace_period() {
        let config = SchedulerConfig {
            max_workers: 1,
            shutdown_grace_period_ms: 20,
            ..fast_config()
        };
        let scheduler = Scheduler::new(config).unwrap();
        scheduler.start();

        let slow = MockWork::new("slow").taking(Duration::from_secs(10));
        let slow_id = scheduler.schedule_task(Arc::new(slow), opts("slow")).unwrap();
        let queued_id = scheduler
            .schedule_task(Arc::new(MockWork::new("next")), opts("next"))
            .unwrap();
        for _ in 0..100 {
            if scheduler.get_task_status(&slow_id) == Some(TaskStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        scheduler.shutdown().await;

        assert!(!scheduler.is_running());
        assert_eq!(scheduler.get_task_status(&slow_id), Some(TaskStatus::Cancelled));
        assert_eq!(scheduler.get_task_status(&queued_id), Some(TaskStatus::Cancelled));
        let metrics = scheduler.metrics();
        assert_eq!(metrics.running_tasks, 0);
        assert_eq!(metrics.busy_workers, 0);
    }

    #[tokio::test]
    async fn restart_after_shutdown() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        scheduler.start();
        scheduler.shutdown().await;

        let id = scheduler
            .schedule_task(Arc::new(MockWork::new("lint")), opts("lint"))
            .unwrap();
        scheduler.start();
        assert!(scheduler.is_running());
        let result = scheduler.execute_task(&id).await.unwrap();
        assert!(result.is_success());

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn finished_id_can_be_resubmitted() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        scheduler.start();

        let first = scheduler
            .run(Arc::new(MockWork::new("lint").failing(1)), opts("lint").max_retries(0))
            .await
            .unwrap();
        assert_eq!(first.status, TaskStatus::Failed);

        let second = scheduler
            .run(Arc::new(MockWork::new("lint")), opts("lint"))
            .await
            .unwrap();
        assert_eq!(second.status, TaskStatus::Completed);
        assert_eq!(scheduler.metrics().failed_tasks, 0);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn statistics_and_cleanup() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        scheduler.start();

        scheduler
            .run(Arc::new(MockWork::new("ok")), opts("ok"))
            .await
            .unwrap();
        scheduler
            .run(Arc::new(MockWork::new("bad").failing(9)), opts("bad").max_retries(1))
            .await
            .unwrap();

        let stats = scheduler.task_statistics();
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert_eq!(stats.total_retries, 1);
        assert_eq!(stats.execution_time.count, 1);
        assert_eq!(stats.failures_by_kind.get(&ErrorKind::Execution), Some(&1));

        assert_eq!(scheduler.cleanup_completed_tasks(Duration::from_secs(3600)), 0);
        assert_eq!(scheduler.cleanup_completed_tasks(Duration::ZERO), 2);
        assert!(scheduler.get_task(&"ok".into()).is_none());
        assert!(matches!(
            scheduler.lookup(&"bad".into()),
            Err(SchedulerError::NotFound(_))
        ));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn worker_snapshots_track_running_task() {
        let scheduler = Scheduler::new(fast_config()).unwrap();
        scheduler.start();

        let id = scheduler
            .schedule_task(Arc::new(CooperativeWork), opts("watch"))
            .unwrap();
        for _ in 0..100 {
            if scheduler.get_task_status(&id) == Some(TaskStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let workers = scheduler.workers();
        assert_eq!(workers.len(), 2);
        let busy: Vec<_> = workers.iter().filter(|w| w.busy).collect();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].task_id, Some(id.clone()));

        scheduler.cancel_task(&id);
        scheduler.shutdown().await;
    }
}
