use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use th_core::config::RoleConfig;
use th_core::types::Task;
use tokio::process::Command;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// The attempt failed; another attempt may succeed.
    #[error("execution failed: {0}")]
    Failed(String),
    /// The work was judged unacceptable. Never retried.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The executor could not start at all. Never retried.
    #[error("could not start executor: {0}")]
    Spawn(String),
}

impl ExecutorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Failed(_))
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Performs the actual work for a claimed task and returns its output.
///
/// Implementations must be cancellation-safe: the agent loop drops the
/// future when the task timeout expires.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<String>;
}

// ---------------------------------------------------------------------------
// CommandExecutor
// ---------------------------------------------------------------------------

/// Runs an external program once per task.
///
/// Task fields are passed as `TASKHIVE_*` environment variables, stdout
/// becomes the task output, and a configured exit code turns the result
/// into a rejection (stderr, or stdout if stderr is empty, is the reason).
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    reject_exit_code: Option<i32>,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            reject_exit_code: None,
            working_dir: None,
        }
    }

    /// `None` when the role has no command configured.
    pub fn from_role(role: &RoleConfig) -> Option<Self> {
        let (program, args) = role.command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            reject_exit_code: role.reject_exit_code,
            working_dir: None,
        })
    }

    pub fn with_reject_exit_code(mut self, code: i32) -> Self {
        self.reject_exit_code = Some(code);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Environment handed to a command for `task`.
pub fn task_env(task: &Task) -> Vec<(&'static str, String)> {
    let mut env = vec![
        ("TASKHIVE_TASK_ID", task.id.clone()),
        ("TASKHIVE_GROUP_ID", task.group_id.clone()),
        ("TASKHIVE_TITLE", task.title.clone()),
        ("TASKHIVE_TASK_TYPE", task.task_type.clone()),
        ("TASKHIVE_PRIORITY", task.priority.as_str().to_string()),
        ("TASKHIVE_ASSIGNED_TO", task.assigned_to.clone()),
        (
            "TASKHIVE_DESCRIPTION",
            task.description.clone().unwrap_or_default(),
        ),
    ];
    let optional = [
        ("TASKHIVE_PARENT_ID", &task.parent_id),
        ("TASKHIVE_REVISION_OF", &task.revision_of),
        ("TASKHIVE_INSTANCE_ID", &task.claimed_by),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            env.push((key, value.clone()));
        }
    }
    env
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, task: &Task) -> Result<String> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(task_env(task))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(task_id = %task.id, program = %self.program, "spawning task command");
        let output = command
            .output()
            .await
            .map_err(|e| ExecutorError::Spawn(format!("{}: {e}", self.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = output.status.code();

        if output.status.success() {
            return Ok(stdout);
        }
        if code.is_some() && code == self.reject_exit_code {
            let reason = if stderr.is_empty() { stdout } else { stderr };
            return Err(ExecutorError::Rejected(reason));
        }

        warn!(task_id = %task.id, exit_code = ?code, "task command failed");
        let detail = if stderr.is_empty() { stdout } else { stderr };
        Err(ExecutorError::Failed(match code {
            Some(code) => format!("exit code {code}: {detail}"),
            None => format!("terminated by signal: {detail}"),
        }))
    }
}
