//! External process unit of work.
//!
//! Runs one analysis tool as a child process. A bare `command` without
//! `args` is run through `sh -c`; otherwise `command` is the executable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use qualis_scheduler::{UnitOfWork, WorkContext, WorkError, WorkOutput};

use crate::plan::ToolSpec;

/// Longest stdout/stderr excerpt kept in a result payload, in bytes.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

pub struct ProcessWork {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl ProcessWork {
    pub fn from_spec(spec: &ToolSpec, working_dir: Option<PathBuf>) -> Self {
        Self {
            name: spec.name.clone(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            working_dir,
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = if self.args.is_empty() {
            let mut sh = Command::new("sh");
            sh.arg("-c").arg(&self.command);
            sh
        } else {
            let mut direct = Command::new(&self.command);
            direct.args(&self.args);
            direct
        };
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // An abandoned attempt (timeout, cancel) must not leave the tool running.
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl UnitOfWork for ProcessWork {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: WorkContext) -> Result<WorkOutput, WorkError> {
        debug!(
            tool = %self.name,
            command = %self.command,
            attempt = ctx.attempt,
            "spawning tool process"
        );
        let child = self.build_command().spawn().map_err(|e| {
            WorkError::Failed(format!("failed to spawn '{}': {e}", self.command))
        })?;

        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = ctx.cancelled() => return Err(WorkError::Cancelled),
        };

        let stdout = truncate(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code();
        debug!(tool = %self.name, ?exit_code, "tool process exited");

        if output.status.success() {
            Ok(WorkOutput::success(json!({
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            })))
        } else {
            let error = match exit_code {
                Some(code) => format!("{} exited with status {code}", self.name),
                None => format!("{} was terminated by a signal", self.name),
            };
            Ok(WorkOutput::error(json!({
                "error": error,
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            })))
        }
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_CAPTURE_BYTES {
        return text.to_string();
    }
    let mut end = MAX_CAPTURE_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated)", &text[..end])
}
