use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch, Mutex};

use crate::message::{self, id_key, Inbound, RpcError};
use crate::process::{BoxedReader, BoxedWriter, ExitInfo, ProcessHandle};

pub const INIT_MARKER_PREFIX: &str = "__ACP_PROXY_INIT_RESULT__:";
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_millis(300_000);

const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("agent not connected")]
    NotConnected,
    #[error("agent closed")]
    Closed,
    #[error("rpc timeout after {timeout_ms}ms: {method}")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("{0}")]
    Remote(RpcError),
    #[error("failed to serialize json-rpc message: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to write agent stdin: {0}")]
    Write(std::io::Error),
    #[error("init timeout after {timeout_ms}ms")]
    InitTimeout { timeout_ms: u64 },
    #[error("init marker JSON parse failed: {0}")]
    InitMarkerParse(String),
    #[error("agent exited before init result (code={code:?}, signal={signal:?})")]
    ExitedBeforeInit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    #[error("failed to capture agent stdin")]
    MissingStdin,
    #[error("failed to capture agent stdout")]
    MissingStdout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InitOutcome {
    pub ok: bool,
    #[serde(default, rename = "exitCode")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
enum InitState {
    NotRequested,
    Pending,
    Ready(InitOutcome),
    Exited(ExitInfo),
    MarkerParse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrPhase {
    Init,
    Agent,
}

impl StderrPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Agent => "agent",
        }
    }
}

/// Receives everything the agent initiates.
pub trait BridgeHandler: Send + Sync + 'static {
    /// `id` is the agent's JSON-RPC id, as later named by `$/cancel_request`.
    fn on_request(
        &self,
        id: &Value,
        method: String,
        params: Value,
    ) -> BoxFuture<'static, Result<Value, RpcError>>;

    fn on_notification(&self, method: String, params: Value);

    fn on_stderr(&self, line: &str, phase: StderrPhase) {
        tracing::info!(phase = phase.as_str(), "agent stderr: {}", line);
    }
}

pub type Redactor = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Clone)]
pub struct BridgeOptions {
    pub rpc_timeout: Duration,
    /// Marker prefix to watch for on stderr; `None` means the agent is ready immediately.
    pub init_marker: Option<String>,
    pub redact: Option<Redactor>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            init_marker: None,
            redact: None,
        }
    }
}

type PendingMap = HashMap<String, oneshot::Sender<Result<Value, BridgeError>>>;

pub struct AgentBridge {
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    rpc_timeout: Duration,
    closed: Arc<AtomicBool>,
    shutting_down: AtomicBool,
    init: watch::Receiver<InitState>,
    process: Mutex<ProcessHandle>,
    exit: watch::Receiver<Option<ExitInfo>>,
    pid: Option<u32>,
    started_at: Instant,
}

impl std::fmt::Debug for AgentBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBridge")
            .field("pid", &self.pid)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl AgentBridge {
    pub fn start(
        mut process: ProcessHandle,
        options: BridgeOptions,
        handler: Arc<dyn BridgeHandler>,
    ) -> Result<Arc<Self>, BridgeError> {
        let stdin = process.take_stdin().ok_or(BridgeError::MissingStdin)?;
        let stdout = process.take_stdout().ok_or(BridgeError::MissingStdout)?;
        let stderr = process.take_stderr();

        let initial = if options.init_marker.is_some() {
            InitState::Pending
        } else {
            InitState::NotRequested
        };
        let (init_tx, init_rx) = watch::channel(initial);
        let init_tx = Arc::new(init_tx);

        let bridge = Arc::new(Self {
            writer: Arc::new(Mutex::new(Some(stdin))),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            rpc_timeout: options.rpc_timeout,
            closed: Arc::new(AtomicBool::new(false)),
            shutting_down: AtomicBool::new(false),
            init: init_rx,
            exit: process.exit_watch(),
            pid: process.pid(),
            process: Mutex::new(process),
            started_at: Instant::now(),
        });

        bridge.spawn_stdout_loop(stdout, handler.clone());
        let stderr_task = stderr.map(|stderr| {
            bridge.spawn_stderr_loop(
                stderr,
                handler,
                init_tx.clone(),
                options.init_marker.clone(),
                options.redact.clone(),
            )
        });
        bridge.spawn_exit_watcher(init_tx, stderr_task);

        Ok(bridge)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn init_pending(&self) -> bool {
        matches!(*self.init.borrow(), InitState::Pending)
    }

    pub async fn send_rpc(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::NotConnected);
        }
        let timeout = timeout.unwrap_or(self.rpc_timeout);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key = id_key(&Value::from(id));
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            pending.insert(key.clone(), tx);
            tracing::debug!(
                method = method,
                id = id,
                pending_count = pending.len(),
                "rpc: request to agent"
            );
        }
        if self.is_closed() {
            self.pending.lock().await.remove(&key);
            return Err(BridgeError::Closed);
        }

        let payload = message::request(id, method, params);
        if let Err(err) = write_line(&self.writer, &payload).await {
            self.pending.lock().await.remove(&key);
            return Err(err);
        }

        let wait_start = Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => {
                tracing::debug!(
                    method = method,
                    id = id,
                    response_ms = wait_start.elapsed().as_millis() as u64,
                    ok = outcome.is_ok(),
                    "rpc: response from agent"
                );
                outcome
            }
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&key);
                Err(BridgeError::Closed)
            }
            Err(_) => {
                self.pending.lock().await.remove(&key);
                tracing::warn!(
                    method = method,
                    id = id,
                    timeout_ms = timeout.as_millis() as u64,
                    age_ms = self.started_at.elapsed().as_millis() as u64,
                    "rpc: timeout waiting for agent response"
                );
                Err(BridgeError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::NotConnected);
        }
        tracing::debug!(method = method, "rpc: notification to agent");
        write_line(&self.writer, &message::notification(method, params)).await
    }

    pub async fn wait_for_init_result(&self, timeout: Duration) -> Result<InitOutcome, BridgeError> {
        let mut init = self.init.clone();
        let waited =
            tokio::time::timeout(timeout, init.wait_for(|state| *state != InitState::Pending)).await;
        let state = match waited {
            Err(_) => {
                return Err(BridgeError::InitTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(_)) => return Err(BridgeError::Closed),
            Ok(Ok(state)) => state.clone(),
        };
        match state {
            InitState::NotRequested => Ok(InitOutcome {
                ok: true,
                exit_code: None,
            }),
            InitState::Ready(outcome) => Ok(outcome),
            InitState::Exited(info) => Err(BridgeError::ExitedBeforeInit {
                code: info.code,
                signal: info.signal,
            }),
            InitState::MarkerParse(message) => Err(BridgeError::InitMarkerParse(message)),
            InitState::Pending => Err(BridgeError::Closed),
        }
    }

    pub async fn close(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            pid = self.pid.unwrap_or(0),
            age_ms = self.started_at.elapsed().as_millis() as u64,
            "closing agent bridge"
        );
        fail_pending(&self.closed, &self.pending).await;
        self.writer.lock().await.take();
        self.process.lock().await.close();
    }

    fn spawn_stdout_loop(&self, stdout: BoxedReader, handler: Arc<dyn BridgeHandler>) {
        let pending = self.pending.clone();
        let writer = self.writer.clone();
        let closed = self.closed.clone();
        let started_at = self.started_at;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut line_count: u64 = 0;

            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                line_count += 1;

                let payload = match serde_json::from_str::<Value>(trimmed) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            line_number = line_count,
                            raw = %truncate(trimmed, 200),
                            "agent stdout: invalid JSON"
                        );
                        continue;
                    }
                };

                match message::classify(&payload) {
                    Inbound::Response { id, outcome } => {
                        let key = id_key(&id);
                        if let Some(tx) = pending.lock().await.remove(&key) {
                            let _ = tx.send(outcome.map_err(BridgeError::Remote));
                        } else {
                            tracing::debug!(
                                id = %key,
                                age_ms = started_at.elapsed().as_millis() as u64,
                                "agent stdout: response has no pending request"
                            );
                        }
                    }
                    Inbound::Request { id, method, params } => {
                        let writer = writer.clone();
                        let future = handler.on_request(&id, method.clone(), params);
                        tokio::spawn(async move {
                            let outcome = future.await;
                            if let Err(err) = &outcome {
                                tracing::debug!(method = %method, error = %err, "agent request failed");
                            }
                            if let Err(err) = write_line(&writer, &message::response(id, outcome)).await {
                                tracing::warn!(method = %method, error = %err, "failed to answer agent request");
                            }
                        });
                    }
                    Inbound::Notification { method, params } => {
                        handler.on_notification(method, params);
                    }
                    Inbound::Unrecognized => {
                        tracing::debug!(line_number = line_count, "agent stdout: unrecognized envelope");
                    }
                }
            }

            tracing::info!(
                total_lines = line_count,
                age_ms = started_at.elapsed().as_millis() as u64,
                "agent stdout: stream ended"
            );
            fail_pending(&closed, &pending).await;
        });
    }

    fn spawn_stderr_loop(
        &self,
        stderr: BoxedReader,
        handler: Arc<dyn BridgeHandler>,
        init_tx: Arc<watch::Sender<InitState>>,
        marker: Option<String>,
        redact: Option<Redactor>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = match &redact {
                    Some(redact) => redact(&line),
                    None => line,
                };
                let pending = matches!(*init_tx.borrow(), InitState::Pending);

                if pending {
                    if let Some(body) = marker
                        .as_deref()
                        .and_then(|marker| line.trim_start().strip_prefix(marker))
                    {
                        let next = match serde_json::from_str::<InitOutcome>(body.trim()) {
                            Ok(outcome) => InitState::Ready(outcome),
                            Err(err) => InitState::MarkerParse(err.to_string()),
                        };
                        tracing::info!(state = ?next, "agent init marker received");
                        init_tx.send_if_modified(|state| {
                            if *state == InitState::Pending {
                                *state = next;
                                true
                            } else {
                                false
                            }
                        });
                        continue;
                    }
                }

                if line.trim().is_empty() {
                    continue;
                }
                let phase = if pending {
                    StderrPhase::Init
                } else {
                    StderrPhase::Agent
                };
                handler.on_stderr(&line, phase);
            }
        })
    }

    fn spawn_exit_watcher(
        &self,
        init_tx: Arc<watch::Sender<InitState>>,
        stderr_task: Option<tokio::task::JoinHandle<()>>,
    ) {
        let mut exit = self.exit.clone();
        let closed = self.closed.clone();
        let pending = self.pending.clone();
        let started_at = self.started_at;

        tokio::spawn(async move {
            let info = match exit.wait_for(|info| info.is_some()).await {
                Ok(info) => info.unwrap_or_default(),
                Err(_) => return,
            };
            if let Some(task) = stderr_task {
                let _ = tokio::time::timeout(STDERR_DRAIN_GRACE, task).await;
            }
            let pending_requests = pending.lock().await.len();
            tracing::warn!(
                code = ?info.code,
                signal = ?info.signal,
                age_ms = started_at.elapsed().as_millis() as u64,
                pending_requests = pending_requests,
                "agent process exited"
            );
            init_tx.send_if_modified(|state| {
                if *state == InitState::Pending {
                    *state = InitState::Exited(info);
                    true
                } else {
                    false
                }
            });
            fail_pending(&closed, &pending).await;
        });
    }
}

async fn fail_pending(closed: &AtomicBool, pending: &Mutex<PendingMap>) {
    closed.store(true, Ordering::SeqCst);
    let drained = {
        let mut guard = pending.lock().await;
        guard.drain().collect::<Vec<_>>()
    };
    for (_, tx) in drained {
        let _ = tx.send(Err(BridgeError::Closed));
    }
}

async fn write_line(writer: &Mutex<Option<BoxedWriter>>, payload: &Value) -> Result<(), BridgeError> {
    let mut bytes = serde_json::to_vec(payload).map_err(BridgeError::Serialize)?;
    bytes.push(b'\n');
    let mut guard = writer.lock().await;
    let Some(stdin) = guard.as_mut() else {
        return Err(BridgeError::NotConnected);
    };
    stdin.write_all(&bytes).await.map_err(BridgeError::Write)?;
    stdin.flush().await.map_err(BridgeError::Write)?;
    Ok(())
}

fn truncate(value: &str, max: usize) -> String {
    if value.len() <= max {
        return value.to_string();
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &value[..end])
}
