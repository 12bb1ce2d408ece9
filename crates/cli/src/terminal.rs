use anyhow::Result;
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use std::io::{self, Write};

use qualis_scheduler::{SchedulerEvent, TaskStatus};

use crate::report::{RunReport, ToolReport};

/// Color scheme for terminal output.
struct Colors;

impl Colors {
    const HEADER: Color = Color::Magenta;
    const PASS: Color = Color::Green;
    const FAIL: Color = Color::Red;
    const CANCELLED: Color = Color::Yellow;
    const RETRY: Color = Color::Yellow;
    const DIM: Color = Color::DarkGrey;
}

/// Human-readable progress and summary output.
pub struct Terminal;

impl Terminal {
    pub fn new() -> Self {
        Self
    }

    /// Print the startup banner.
    pub fn print_banner(&self, plan: &str, tools: usize, workers: usize) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print("qualis"),
            ResetColor,
            Print(format!(" - running {tools} tools from {plan}\n")),
            SetForegroundColor(Colors::DIM),
            Print(format!("Workers: {workers}\n")),
            Print("---\n"),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// One progress line for the lifecycle events worth showing.
    pub fn display_event(&self, event: &SchedulerEvent) -> Result<()> {
        let mut stdout = io::stdout();
        match event {
            SchedulerEvent::TaskStarted { task_id, attempt, .. } => {
                let suffix = if *attempt > 1 {
                    format!(" (attempt {attempt})")
                } else {
                    String::new()
                };
                execute!(
                    stdout,
                    SetForegroundColor(Colors::DIM),
                    Print(format!("  started   {task_id}{suffix}\n")),
                    ResetColor,
                )?;
            }
            SchedulerEvent::TaskRetry {
                task_id,
                delay,
                error,
                ..
            } => {
                execute!(
                    stdout,
                    SetForegroundColor(Colors::RETRY),
                    Print(format!("  retrying  {task_id} in {delay:?}: {error}\n")),
                    ResetColor,
                )?;
            }
            SchedulerEvent::TaskCompleted {
                task_id,
                execution_time,
                ..
            } => {
                execute!(
                    stdout,
                    SetForegroundColor(Colors::PASS),
                    Print("  passed    "),
                    ResetColor,
                    Print(format!("{task_id} ({} ms)\n", execution_time.as_millis())),
                )?;
            }
            SchedulerEvent::TaskFailed { task_id, error, .. } => {
                execute!(
                    stdout,
                    SetForegroundColor(Colors::FAIL),
                    Print("  failed    "),
                    ResetColor,
                    Print(format!("{task_id}: {}\n", error.message)),
                )?;
            }
            SchedulerEvent::TaskCancelled { task_id } => {
                execute!(
                    stdout,
                    SetForegroundColor(Colors::CANCELLED),
                    Print(format!("  cancelled {task_id}\n")),
                    ResetColor,
                )?;
            }
            _ => return Ok(()),
        }
        stdout.flush()?;
        Ok(())
    }

    /// Print the end-of-run table.
    pub fn print_summary(&self, report: &RunReport) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::DIM),
            Print("---\n"),
            ResetColor,
        )?;

        let width = report.tools.iter().map(|t| t.name.len()).max().unwrap_or(0);
        for tool in &report.tools {
            self.print_tool_line(&mut stdout, tool, width)?;
        }

        let elapsed = report.finished_at - report.started_at;
        let (color, verdict) = if report.is_success() {
            (Colors::PASS, "PASSED")
        } else {
            (Colors::FAIL, "FAILED")
        };
        execute!(
            stdout,
            Print("\n"),
            SetForegroundColor(color),
            Print(verdict),
            ResetColor,
            Print(format!(
                ": {} passed, {} failed, {} retries in {} ms\n",
                report.passed(),
                report.failed(),
                report.statistics.total_retries,
                elapsed.num_milliseconds()
            )),
        )?;
        stdout.flush()?;
        Ok(())
    }

    fn print_tool_line(&self, stdout: &mut io::Stdout, tool: &ToolReport, width: usize) -> Result<()> {
        let (color, label) = match tool.status {
            TaskStatus::Completed => (Colors::PASS, "pass"),
            TaskStatus::Cancelled => (Colors::CANCELLED, "cancelled"),
            _ => (Colors::FAIL, "fail"),
        };
        execute!(
            stdout,
            SetForegroundColor(color),
            Print(format!("{label:<9} ")),
            ResetColor,
            Print(format!("{:<width$}  {:>7} ms", tool.name, tool.duration_ms)),
        )?;
        if let Some(error) = &tool.error {
            execute!(
                stdout,
                SetForegroundColor(Colors::DIM),
                Print(format!("  {error}")),
                ResetColor,
            )?;
        }
        execute!(stdout, Print("\n"))?;
        Ok(())
    }

    /// Print an error message.
    pub fn print_error(&self, msg: &str) -> Result<()> {
        let mut stderr = io::stderr();
        execute!(
            stderr,
            SetForegroundColor(Colors::FAIL),
            Print(format!("error: {msg}\n")),
            ResetColor,
        )?;
        Ok(())
    }

    /// Print an informational message.
    pub fn print_info(&self, msg: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::DIM),
            Print(format!("{msg}\n")),
            ResetColor,
        )?;
        Ok(())
    }
}
