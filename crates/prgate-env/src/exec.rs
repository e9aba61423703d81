//! Command execution seam.
//!
//! Every external collaborator (package manager, test tool, product CLI,
//! container runtime, git) is driven through [`CommandExecutor`]. The process
//! executor spawns local children; the container executor rewrites each
//! invocation into `<runtime> exec` against a running container.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::ExecError;

/// A command as written in configuration.
///
/// An array is executed directly; a string is handed to `sh -c`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Argv(Vec<String>),
    Shell(String),
}

impl CommandSpec {
    /// Build an argv command from string slices.
    pub fn argv<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::Argv(parts.into_iter().map(Into::into).collect())
    }

    /// Build a shell command.
    pub fn shell(script: impl Into<String>) -> Self {
        CommandSpec::Shell(script.into())
    }

    /// The argv actually executed.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            CommandSpec::Argv(parts) => parts.clone(),
            CommandSpec::Shell(script) => {
                vec!["sh".to_string(), "-c".to_string(), script.clone()]
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CommandSpec::Argv(parts) => parts.is_empty(),
            CommandSpec::Shell(script) => script.trim().is_empty(),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandSpec::Argv(parts) => write!(f, "{}", parts.join(" ")),
            CommandSpec::Shell(script) => write!(f, "{}", script),
        }
    }
}

/// One command launch: what to run, where, and with which extra variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(command: &CommandSpec) -> Self {
        Self {
            argv: command.to_argv(),
            workdir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn in_dir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Space-joined argv, for logs and test assertions.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Launches commands and waits for them to finish.
///
/// No per-command timeout is applied; the enclosing job deadline is the only
/// limit, and dropping the returned future must terminate the child.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError>;
}

/// Runs commands as local child processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        let start = Instant::now();
        let (program, args) = invocation.argv.split_first().ok_or(ExecError::EmptyCommand)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.workdir {
            command.current_dir(dir);
        }

        debug!(command = %invocation.command_line(), "spawning");
        let child = command.spawn().map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;
        let output = child.wait_with_output().await?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Runs commands inside an already running container via `<runtime> exec`.
pub struct ContainerExecutor {
    inner: Arc<dyn CommandExecutor>,
    runtime: String,
    container: String,
}

impl ContainerExecutor {
    pub fn new(
        inner: Arc<dyn CommandExecutor>,
        runtime: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            runtime: runtime.into(),
            container: container.into(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Rewrite an invocation so it runs inside the container. The working
    /// directory and variables move into `exec` flags; the host side runs
    /// with neither.
    pub fn wrap(&self, invocation: &Invocation) -> Invocation {
        let mut argv = vec![self.runtime.clone(), "exec".to_string()];
        if let Some(dir) = &invocation.workdir {
            argv.push("-w".to_string());
            argv.push(dir.to_string_lossy().into_owned());
        }
        for (key, value) in &invocation.env {
            argv.push("-e".to_string());
            argv.push(format!("{key}={value}"));
        }
        argv.push(self.container.clone());
        argv.extend(invocation.argv.iter().cloned());
        Invocation {
            argv,
            workdir: None,
            env: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl CommandExecutor for ContainerExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        if invocation.argv.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        self.inner.execute(&self.wrap(invocation)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_command_runs_through_sh() {
        let cmd = CommandSpec::shell("redis-server --daemonize yes");
        assert_eq!(
            cmd.to_argv(),
            vec!["sh", "-c", "redis-server --daemonize yes"]
        );
    }

    #[test]
    fn untagged_serde_accepts_both_forms() {
        let argv: CommandSpec = serde_json::from_str(r#"["python3", "-m", "pytest"]"#).unwrap();
        assert_eq!(argv, CommandSpec::argv(["python3", "-m", "pytest"]));

        let shell: CommandSpec = serde_json::from_str(r#""./slips.py -cc""#).unwrap();
        assert_eq!(shell, CommandSpec::shell("./slips.py -cc"));
    }

    #[test]
    fn container_wrap_moves_workdir_and_env_into_flags() {
        let exec = ContainerExecutor::new(Arc::new(ProcessExecutor), "docker", "prgate-job-1");
        let mut env = BTreeMap::new();
        env.insert("PRODUCT_VERSION".to_string(), "1.0.7".to_string());
        let inv = Invocation::new(&CommandSpec::argv(["redis-cli", "ping"]))
            .in_dir("/StratosphereLinuxIPS")
            .with_env(env);

        let wrapped = exec.wrap(&inv);
        assert_eq!(
            wrapped.argv,
            vec![
                "docker",
                "exec",
                "-w",
                "/StratosphereLinuxIPS",
                "-e",
                "PRODUCT_VERSION=1.0.7",
                "prgate-job-1",
                "redis-cli",
                "ping",
            ]
        );
        assert!(wrapped.workdir.is_none());
        assert!(wrapped.env.is_empty());
    }

    #[tokio::test]
    async fn process_executor_captures_stdout() {
        let output = ProcessExecutor
            .execute(&Invocation::new(&CommandSpec::argv(["echo", "hello"])))
            .await
            .expect("execute failed");
        assert!(output.success());
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn process_executor_reports_non_zero_exit() {
        let output = ProcessExecutor
            .execute(&Invocation::new(&CommandSpec::shell("exit 3")))
            .await
            .expect("execute failed");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let err = ProcessExecutor
            .execute(&Invocation::new(&CommandSpec::argv([
                "/nonexistent-binary-that-does-not-exist",
            ])))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let err = ProcessExecutor
            .execute(&Invocation::new(&CommandSpec::Argv(vec![])))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::EmptyCommand));
    }
}
