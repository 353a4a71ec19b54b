//! External command execution
//!
//! Transports and host inspection shell out to OS tools (`vmware-rpctool`,
//! `vmtoolsd`, `ip`). They go through [`CommandRunner`] so tests can replace
//! the executables with scripted responses.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::BootstrapError;

/// Captured result of one command invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (`None` if terminated by a signal)
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, killing it once `timeout` elapses
    ///
    /// A non-zero exit is reported through [`CommandOutput::status`], not as
    /// an error. Errors mean the program could not be run to completion.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, BootstrapError>;
}

/// Runs commands on the host with `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, BootstrapError> {
        debug!("Running {} {:?}", program, args);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| BootstrapError::Timeout(format!("{program} ({}s)", timeout.as_secs())))?
            .map_err(|e| BootstrapError::Command(format!("{program}: {e}")))?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a prepared command with `input` on stdin and capture its output
///
/// Used for tools that read their payload from stdin (`gpg`, external part
/// handlers). Output stays binary; the child is killed on timeout.
pub async fn run_with_input(
    mut command: Command,
    input: &[u8],
    timeout: Duration,
) -> Result<std::process::Output, BootstrapError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();
    debug!("Running {} with {} bytes on stdin", program, input.len());

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BootstrapError::Command(format!("{program}: {e}")))?;

    let stdin = child.stdin.take();
    let io = async move {
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A child that exits without reading closes the pipe early
                if let Err(e) = stdin.write_all(input).await {
                    debug!("stdin closed early: {}", e);
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    tokio::time::timeout(timeout, io)
        .await
        .map_err(|_| BootstrapError::Timeout(format!("{program} ({}s)", timeout.as_secs())))?
        .map_err(|e| BootstrapError::Command(format!("{program}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let out = SystemRunner
            .run(
                "sh",
                &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let result = SystemRunner
            .run("/nonexistent/tool", &[], Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(BootstrapError::Command(_))));
    }

    #[tokio::test]
    async fn test_run_with_input_pipes_stdin() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "tr a-z A-Z"]);
        let out = run_with_input(cmd, b"hello", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(out.status.success());
        assert_eq!(out.stdout, b"HELLO");
    }

    #[tokio::test]
    async fn test_run_with_input_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let result = run_with_input(cmd, b"", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(BootstrapError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let result = SystemRunner
            .run("sleep", &["5".to_string()], Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(BootstrapError::Timeout(_))));
    }
}
