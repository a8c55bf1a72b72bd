//! External command execution
//!
//! All privileged networking tools are invoked through [`CommandRunner`], so
//! the provisioner can be driven by a fake runner in tests. Every invocation
//! carries its own timeout, and a timeout is reported separately from a
//! non-zero exit.

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout,
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Output of a command that exited with status 0
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Output of a command that exited with a non-zero status
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Command runner errors (the command never produced an exit status)
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Failed to run '{command}': {message}")]
    Spawn { command: String, message: String },
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// Runs commands on the host with `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner {
    use_sudo: bool,
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every command with non-interactive `sudo`
    pub fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let mut command = if self.use_sudo {
            let mut command = tokio::process::Command::new("sudo");
            command.arg("-n").arg(&spec.program);
            command
        } else {
            tokio::process::Command::new(&spec.program)
        };

        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %spec, "Running command");

        let child = command.spawn().map_err(|e| CommandError::Spawn {
            command: spec.to_string(),
            message: e.to_string(),
        })?;

        // Dropping the wait future on timeout kills the child (kill_on_drop)
        let output = tokio::time::timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| CommandError::Timeout {
                command: spec.to_string(),
                timeout: spec.timeout,
            })?
            .map_err(|e| CommandError::Spawn {
                command: spec.to_string(),
                message: e.to_string(),
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_display() {
        let spec = CommandSpec::new(
            "wg-quick",
            ["up", "/etc/wgpool/tunnels/wg101.conf"],
            Duration::from_secs(1),
        );
        assert_eq!(spec.to_string(), "wg-quick up /etc/wgpool/tunnels/wg101.conf");
    }

    #[test]
    fn test_output_success() {
        assert!(CommandOutput::ok("").success());
        assert!(!CommandOutput::failed(1, "boom").success());
        assert!(!CommandOutput::default().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemCommandRunner::new();
        let output = runner
            .run(&CommandSpec::new(
                "sh",
                ["-c", "echo out; echo err >&2; exit 3"],
                Duration::from_secs(5),
            ))
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_timeout() {
        let runner = SystemCommandRunner::new();
        let result = runner
            .run(&CommandSpec::new("sleep", ["5"], Duration::from_millis(100)))
            .await;

        assert!(matches!(result, Err(CommandError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let runner = SystemCommandRunner::new();
        let result = runner
            .run(&CommandSpec::new(
                "wgpool-definitely-not-installed",
                Vec::<String>::new(),
                Duration::from_secs(1),
            ))
            .await;

        assert!(matches!(result, Err(CommandError::Spawn { .. })));
    }
}
