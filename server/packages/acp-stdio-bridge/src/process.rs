use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Instant;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send + Sync>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send + Sync>>;

type CloseHook = Box<dyn FnOnce() + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("failed to spawn subprocess `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to capture subprocess stdin")]
    MissingStdin,
    #[error("failed to capture subprocess stdout")]
    MissingStdout,
    #[error("failed to capture subprocess stderr")]
    MissingStderr,
}

/// A running process seen as three byte streams plus an exit notification.
///
/// Handles are built either from a spawned [`Command`] or from arbitrary
/// streams, so providers that tunnel stdio through another CLI and tests that
/// fake an agent share the same surface.
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Option<BoxedWriter>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    exit: watch::Receiver<Option<ExitInfo>>,
    kill: Option<mpsc::Sender<()>>,
    close_hooks: Vec<CloseHook>,
    closed: bool,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exit", &*self.exit.borrow())
            .field("closed", &self.closed)
            .finish()
    }
}

impl ProcessHandle {
    pub fn spawn(mut command: Command, shown: impl Into<String>) -> Result<Self, ProcessError> {
        let shown = shown.into();
        let spawn_start = Instant::now();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|error| {
            tracing::error!(command = %shown, error = %error, "failed to spawn process");
            ProcessError::Spawn {
                command: shown.clone(),
                error,
            }
        })?;

        let pid = child.id();
        tracing::debug!(
            command = %shown,
            pid = pid.unwrap_or(0),
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "process spawned"
        );

        let stdin = child.stdin.take().ok_or(ProcessError::MissingStdin)?;
        let stdout = child.stdout.take().ok_or(ProcessError::MissingStdout)?;
        let stderr = child.stderr.take().ok_or(ProcessError::MissingStderr)?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx.recv() => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo::from_status(status),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read process exit status");
                    ExitInfo::default()
                }
            };
            tracing::debug!(
                code = ?info.code,
                signal = ?info.signal,
                age_ms = spawn_start.elapsed().as_millis() as u64,
                "process exited"
            );
            let _ = exit_tx.send(Some(info));
        });

        Ok(Self {
            pid,
            stdin: Some(Box::pin(stdin)),
            stdout: Some(Box::pin(stdout)),
            stderr: Some(Box::pin(stderr)),
            exit: exit_rx,
            kill: Some(kill_tx),
            close_hooks: Vec::new(),
            closed: false,
        })
    }

    pub fn from_streams(
        stdin: BoxedWriter,
        stdout: BoxedReader,
        stderr: Option<BoxedReader>,
        exit: watch::Receiver<Option<ExitInfo>>,
    ) -> Self {
        Self {
            pid: None,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr,
            exit,
            kill: None,
            close_hooks: Vec::new(),
            closed: false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit.clone()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Runs `hook` once when the handle is closed, after the kill request.
    pub fn on_close(&mut self, hook: impl FnOnce() + Send + Sync + 'static) {
        self.close_hooks.push(Box::new(hook));
    }

    /// Resolves with the exit status. The future does not borrow the handle.
    pub fn wait(&self) -> impl Future<Output = ExitInfo> + Send + 'static {
        let mut exit = self.exit.clone();
        async move {
            let waited = exit.wait_for(|info| info.is_some()).await.map(|info| *info);
            match waited {
                Ok(info) => info.unwrap_or_default(),
                Err(_) => exit.borrow().unwrap_or_default(),
            }
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stdin.take();
        if let Some(kill) = self.kill.take() {
            let _ = kill.try_send(());
        }
        for hook in self.close_hooks.drain(..) {
            hook();
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn format_command_for_display(program: &str, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(display_quote(program));
    for arg in args {
        parts.push(display_quote(arg));
    }
    parts.join(" ")
}

fn display_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "-_./=:@".contains(ch))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}
