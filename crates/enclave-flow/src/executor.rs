//! Subprocess execution seam.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the process exited with code zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external programs.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `program` with `args` to completion and captures its output.
    ///
    /// An unsuccessful exit is not an error at this level.
    async fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Renders a command line for logs and error messages.
#[must_use]
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs a command and fails unless it exits successfully.
///
/// # Errors
///
/// Returns `Error::Execution` carrying stderr (or the exit code when stderr
/// is empty) for an unsuccessful exit, and propagates spawn failures.
pub async fn run_checked(
    executor: &dyn Executor,
    program: &str,
    args: &[String],
) -> Result<String> {
    let output = executor.execute(program, args).await?;
    if output.success() {
        return Ok(output.stdout);
    }

    let stderr = output.stderr.trim();
    let message = if stderr.is_empty() {
        match output.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    } else {
        stderr.to_string()
    };
    Err(Error::Execution {
        command: command_line(program, args),
        message,
    })
}

/// [`Executor`] spawning real processes with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl CommandExecutor {
    /// Creates an executor inheriting the current directory and environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs commands in `dir`.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable to every command.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    #[tracing::instrument(skip(self, args), fields(command = %command_line(program, args)))]
    async fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut command = tokio::process::Command::new(program);
        command.args(args).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let output = command.output().await.map_err(|e| Error::Execution {
            command: command_line(program, args),
            message: format!("failed to spawn: {e}"),
        })?;

        let output = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::debug!(exit_code = ?output.exit_code, "command finished");
        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn captures_stdout_of_successful_command() {
        let executor = CommandExecutor::new();
        let stdout = run_checked(&executor, "sh", &sh("echo hello"))
            .await
            .unwrap();
        assert_eq!(stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let executor = CommandExecutor::new();
        let err = run_checked(&executor, "sh", &sh("echo nope >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            Error::Execution { command, message } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn exit_code_is_used_without_stderr() {
        let executor = CommandExecutor::new();
        let output = executor.execute("sh", &sh("exit 4")).await.unwrap();
        assert_eq!(output.exit_code, Some(4));
        assert!(!output.success());

        let err = run_checked(&executor, "sh", &sh("exit 4")).await.unwrap_err();
        assert!(err.to_string().contains("exit code 4"));
    }

    #[tokio::test]
    async fn environment_is_passed_through() {
        let executor = CommandExecutor::new().with_env("ENCLAVE_TEST_VALUE", "42");
        let stdout = run_checked(&executor, "sh", &sh("echo $ENCLAVE_TEST_VALUE"))
            .await
            .unwrap();
        assert_eq!(stdout.trim(), "42");
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let executor = CommandExecutor::new();
        let err = executor
            .execute("definitely-not-a-real-program-xyz", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
