mod cli;
mod plan;
mod process;
mod report;
mod run;
mod terminal;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error};

use crate::cli::{CliArgs, Command};
use crate::plan::AnalysisPlan;
use crate::terminal::Terminal;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let args = CliArgs::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let terminal = Terminal::new();

    match args.command {
        Command::CheckPlan(check) => {
            let plan = AnalysisPlan::load(&check.plan)?;
            if let Err(e) = plan.validate() {
                terminal.print_error(&format!("{:#}", e))?;
                std::process::exit(2);
            }
            terminal.print_info(&format!(
                "{}: {} tools, plan is valid",
                check.plan.display(),
                plan.tools.len()
            ))?;
            for tool in &plan.tools {
                let deps = if tool.depends_on.is_empty() {
                    String::new()
                } else {
                    format!(" <- {}", tool.depends_on.join(", "))
                };
                terminal.print_info(&format!("  [{:>3}] {}{}", tool.priority, tool.name, deps))?;
            }
        }
        Command::Run(run_args) => {
            let mut plan = AnalysisPlan::load(&run_args.plan.plan)?;
            run::apply_overrides(&mut plan, &run_args);
            debug!(scheduler = ?plan.scheduler, "effective scheduler config");

            if !run_args.json {
                terminal.print_banner(
                    &run_args.plan.plan.display().to_string(),
                    plan.tools.len(),
                    plan.scheduler.resolved_max_workers(),
                )?;
            }

            let report = match run::run_plan(&plan, !run_args.json).await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "analysis run failed");
                    return Err(e);
                }
            };

            if run_args.json {
                let json = serde_json::to_string_pretty(&report)
                    .context("failed to serialize report")?;
                println!("{json}");
            } else {
                terminal.print_summary(&report)?;
            }

            if !report.is_success() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
