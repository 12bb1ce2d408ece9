use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use qualis_scheduler::resolver::{find_cycles, format_cycle};
use qualis_scheduler::{PriorityQueue, SchedulerConfig, TaskId, TaskOptions};

/// Default plan file looked up in the working directory.
pub const DEFAULT_PLAN_FILE: &str = "qualis.toml";

/// An analysis plan: the tools to run and how to schedule them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisPlan {
    /// Scheduler settings. Missing keys take their defaults.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Directory tools run in, relative to the plan file.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default, rename = "tools")]
    pub tools: Vec<ToolSpec>,
}

/// One analysis tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique name, also used as the task id.
    pub name: String,

    /// Executable, or a shell command line when `args` is empty.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Names of tools that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Extra environment variables for the process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_priority() -> i32 {
    5
}

impl ToolSpec {
    pub fn task_options(&self) -> TaskOptions {
        let mut options = TaskOptions::new()
            .id(self.name.as_str())
            .name(self.name.as_str())
            .priority(self.priority)
            .dependencies(self.depends_on.iter().map(String::as_str));
        if let Some(ms) = self.timeout_ms {
            options = options.timeout(Duration::from_millis(ms));
        }
        if let Some(retries) = self.max_retries {
            options = options.max_retries(retries);
        }
        options
    }
}

impl AnalysisPlan {
    /// Parse a plan from TOML text. `QUALIS_*` environment overrides are
    /// applied to the scheduler section.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut plan: Self = toml::from_str(toml_str).context("failed to parse analysis plan")?;
        plan.scheduler.apply_env_overrides();
        Ok(plan)
    }

    /// Load a plan file. A relative `working_dir` is resolved against the
    /// plan's directory; without one, tools run next to the plan.
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading analysis plan");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan: {}", path.display()))?;
        let mut plan = Self::from_toml(&content)
            .with_context(|| format!("invalid plan: {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        plan.working_dir = Some(match plan.working_dir.take() {
            Some(dir) if dir.is_relative() => base.join(dir),
            Some(dir) => dir,
            None => base.to_path_buf(),
        });
        Ok(plan)
    }

    /// Check the plan before running it: scheduler settings, duplicate
    /// names, unknown dependencies and dependency cycles.
    pub fn validate(&self) -> Result<()> {
        self.scheduler
            .validate()
            .context("invalid [scheduler] section")?;

        if self.tools.is_empty() {
            bail!("plan defines no tools");
        }

        let mut names = HashSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                bail!("tool with command '{}' has an empty name", tool.command);
            }
            if tool.command.trim().is_empty() {
                bail!("tool '{}' has an empty command", tool.name);
            }
            if !names.insert(tool.name.as_str()) {
                bail!("duplicate tool name '{}'", tool.name);
            }
        }

        for tool in &self.tools {
            for dep in &tool.depends_on {
                if !names.contains(dep.as_str()) {
                    bail!("tool '{}' depends on unknown tool '{}'", tool.name, dep);
                }
            }
        }

        if self.tools.len() > self.scheduler.max_queue_size {
            bail!(
                "plan has {} tools but max_queue_size is {}",
                self.tools.len(),
                self.scheduler.max_queue_size
            );
        }

        let mut queue = PriorityQueue::new(self.tools.len());
        for tool in &self.tools {
            let deps = tool.depends_on.iter().map(|d| TaskId::from(d.as_str())).collect();
            queue.insert(TaskId::from(tool.name.as_str()), tool.priority.into(), deps)?;
        }
        if let Some(cycle) = find_cycles(&queue).first() {
            bail!("circular dependency: {}", format_cycle(cycle));
        }
        Ok(())
    }
}
