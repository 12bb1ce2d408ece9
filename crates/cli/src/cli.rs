use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::plan::DEFAULT_PLAN_FILE;

/// Code-quality orchestrator.
///
/// Runs the analysis tools listed in a plan file concurrently, honoring
/// priorities, dependencies, timeouts and retries.
#[derive(Parser, Debug)]
#[command(name = "qualis", about = "Run code-quality tools from an analysis plan")]
pub struct CliArgs {
    /// Verbose logging (debug level unless RUST_LOG is set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every tool in the plan and report the results
    Run(RunArgs),

    /// Validate a plan without running anything
    CheckPlan(PlanArgs),
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the analysis plan
    #[arg(long, env = "QUALIS_PLAN", default_value = DEFAULT_PLAN_FILE)]
    pub plan: PathBuf,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// Worker pool size override (0 = available parallelism)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Default per-tool timeout override in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Retry budget override for every tool
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Print the final report as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_overrides() {
        let args = CliArgs::parse_from([
            "qualis",
            "run",
            "--plan",
            "ci/qualis.toml",
            "--workers",
            "8",
            "--timeout-ms",
            "1500",
            "--json",
        ]);
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.plan.plan, PathBuf::from("ci/qualis.toml"));
        assert_eq!(run.workers, Some(8));
        assert_eq!(run.timeout_ms, Some(1500));
        assert!(run.max_retries.is_none());
        assert!(run.json);
    }

    #[test]
    fn check_plan_defaults_to_local_file() {
        let args = CliArgs::parse_from(["qualis", "-v", "check-plan"]);
        assert!(args.verbose);
        let Command::CheckPlan(check) = args.command else {
            panic!("expected check-plan");
        };
        // QUALIS_PLAN may be set in the environment; only check the default
        if std::env::var_os("QUALIS_PLAN").is_none() {
            assert_eq!(check.plan, PathBuf::from(DEFAULT_PLAN_FILE));
        }
    }
}
