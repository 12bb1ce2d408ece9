use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use qualis_scheduler::{Scheduler, SchedulerError, TaskId, UnitOfWork};

use crate::cli::RunArgs;
use crate::plan::AnalysisPlan;
use crate::process::ProcessWork;
use crate::report::{RunReport, ToolReport};
use crate::terminal::Terminal;

/// How long to wait for the progress printer to drain after shutdown.
const PROGRESS_DRAIN: Duration = Duration::from_secs(1);

/// Apply command-line overrides on top of the plan file.
pub fn apply_overrides(plan: &mut AnalysisPlan, args: &RunArgs) {
    if let Some(workers) = args.workers {
        plan.scheduler.max_workers = workers;
    }
    if let Some(ms) = args.timeout_ms {
        plan.scheduler.worker_timeout_ms = ms;
        plan.scheduler.max_task_execution_time_ms =
            plan.scheduler.max_task_execution_time_ms.max(ms);
    }
    if let Some(retries) = args.max_retries {
        plan.scheduler.max_retries = retries;
        for tool in &mut plan.tools {
            tool.max_retries = Some(retries);
        }
    }
}

/// Schedule every tool in the plan, wait for all of them and collect the
/// report. Ctrl-C cancels whatever has not finished.
pub async fn run_plan(plan: &AnalysisPlan, show_progress: bool) -> Result<RunReport> {
    plan.validate()?;
    let started_at = Utc::now();

    let scheduler =
        Scheduler::new(plan.scheduler.clone()).context("failed to create scheduler")?;

    let mut events = scheduler.subscribe();
    let progress = tokio::spawn(async move {
        let terminal = Terminal::new();
        loop {
            match events.recv().await {
                Ok(event) => {
                    if show_progress {
                        if let Err(e) = terminal.display_event(&event) {
                            warn!(error = %e, "failed to print progress");
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress output fell behind, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let batch = plan
        .tools
        .iter()
        .map(|tool| {
            let work: Arc<dyn UnitOfWork> =
                Arc::new(ProcessWork::from_spec(tool, plan.working_dir.clone()));
            (work, tool.task_options())
        })
        .collect();
    let ids = scheduler
        .schedule_batch(batch)
        .context("failed to schedule tools")?;

    scheduler.start();
    info!(tools = ids.len(), "analysis run started");

    let wait_all = async {
        for id in &ids {
            if let Err(e) = scheduler.execute_task(id).await {
                warn!(task_id = %id, error = %e, "stopped waiting for tool");
            }
        }
    };
    tokio::select! {
        _ = wait_all => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling remaining tools");
        }
    }

    scheduler.shutdown().await;

    let tools = plan
        .tools
        .iter()
        .zip(&ids)
        .map(|(tool, id)| collect_result(&scheduler, &tool.name, id))
        .collect();
    let report = RunReport {
        started_at,
        finished_at: Utc::now(),
        tools,
        metrics: scheduler.metrics(),
        statistics: scheduler.task_statistics(),
    };
    info!(
        passed = report.passed(),
        failed = report.failed(),
        "analysis run finished"
    );

    drop(scheduler);
    let mut progress = progress;
    if tokio::time::timeout(PROGRESS_DRAIN, &mut progress).await.is_err() {
        progress.abort();
    }
    Ok(report)
}

fn collect_result(scheduler: &Scheduler, name: &str, id: &TaskId) -> ToolReport {
    match scheduler.get_task_result(id) {
        Some(result) => ToolReport::from_result(name, &result),
        None => ToolReport::unresolved(name, &SchedulerError::NotFound(id.clone())),
    }
}
