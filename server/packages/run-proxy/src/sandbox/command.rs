use std::process::Stdio;
use std::time::{Duration, Instant};

use acp_stdio_bridge::process::format_command_for_display;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::SandboxError;

pub const DEFAULT_CLI_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Both streams, trimmed, for error messages and substring checks.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr).trim().to_string()
    }
}

/// Runs `program args...` to completion and captures both streams.
/// The child is killed when `timeout` elapses.
pub async fn run_capture(
    program: &str,
    args: &[String],
    timeout: Duration,
    stdin: Option<&str>,
) -> Result<CommandOutput, SandboxError> {
    let shown = format_command_for_display(program, args);
    let start = Instant::now();
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| SandboxError::Command {
        command: shown.clone(),
        message: if err.kind() == std::io::ErrorKind::NotFound {
            format!("{program} not found")
        } else {
            err.to_string()
        },
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        pipe.shutdown().await?;
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            tracing::warn!(command = %shown, timeout_ms = timeout.as_millis() as u64, "cli command timed out");
            return Err(SandboxError::CommandTimeout {
                command: shown,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
    };

    let result = CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    tracing::debug!(
        command = %shown,
        code = ?result.code,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "cli command finished"
    );
    Ok(result)
}

/// Like [`run_capture`] but a non-zero exit becomes an error carrying the
/// command's own output.
pub async fn run_checked(program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, SandboxError> {
    let output = run_capture(program, args, timeout, None).await?;
    if output.success() {
        return Ok(output);
    }
    let message = output.combined();
    Err(SandboxError::Command {
        command: format_command_for_display(program, args),
        message: if message.is_empty() {
            format!("exitCode={}", output.code.map(|code| code.to_string()).unwrap_or_else(|| "null".to_string()))
        } else {
            message
        },
    })
}

pub(crate) fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}
