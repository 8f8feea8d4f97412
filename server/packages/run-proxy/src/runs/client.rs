//! Answers what the agent asks of us: permissions, workspace file access and
//! the notifications it streams while a prompt runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use acp_stdio_bridge::{BridgeHandler, RpcError, StderrPhase};
use futures::future::BoxFuture;
use run_proxy_agent_inputs::is_descendant;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::proxy::ProxyContext;
use crate::sandbox::{guest_to_host, posix_normalize};

use super::init::parse_init_step_line;
use super::retry::{map_bridge_error, with_auth_retry};
use super::Run;

pub const TERMINAL_DISABLED_CODE: i64 = -32000;
pub const RESOURCE_NOT_FOUND_CODE: i64 = -32004;

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionChoice {
    Selected(String),
    Cancelled,
}

struct PendingPermission {
    options: Vec<Value>,
    reply: oneshot::Sender<Value>,
}

/// Permission requests forwarded to the orchestrator and not yet answered,
/// keyed by the agent's request id.
#[derive(Default)]
pub struct PendingPermissions {
    inner: StdMutex<HashMap<String, PendingPermission>>,
}

impl std::fmt::Debug for PendingPermissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPermissions")
            .field("pending", &self.len())
            .finish()
    }
}

impl PendingPermissions {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingPermission>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, request_id: &str, options: Vec<Value>) -> oneshot::Receiver<Value> {
        let (reply, rx) = oneshot::channel();
        self.lock()
            .insert(request_id.to_string(), PendingPermission { options, reply });
        rx
    }

    /// `false` when nothing is waiting under `request_id`.
    pub fn resolve(&self, request_id: &str, choice: &PermissionChoice) -> bool {
        let Some(pending) = self.lock().remove(request_id) else {
            return false;
        };
        let outcome = permission_outcome(&pending.options, choice);
        pending.reply.send(outcome).is_ok()
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        self.resolve(request_id, &PermissionChoice::Cancelled)
    }

    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, pending) in drained {
            let _ = pending.reply.send(cancelled_outcome());
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn option_id(option: &Value) -> Option<&str> {
    option.get("optionId").and_then(Value::as_str)
}

/// `allow_once` when offered, else the first option.
pub fn default_option_id(options: &[Value]) -> Option<String> {
    options
        .iter()
        .find(|option| option.get("kind").and_then(Value::as_str) == Some("allow_once"))
        .or_else(|| options.first())
        .and_then(option_id)
        .map(str::to_string)
}

fn cancelled_outcome() -> Value {
    json!({ "outcome": { "outcome": "cancelled" } })
}

fn selected_outcome(option_id: &str) -> Value {
    json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
}

/// An unknown option falls back to the default one; no options at all means
/// the request is cancelled.
pub fn permission_outcome(options: &[Value], choice: &PermissionChoice) -> Value {
    match choice {
        PermissionChoice::Cancelled => cancelled_outcome(),
        PermissionChoice::Selected(requested) => {
            if options.iter().any(|option| option_id(option) == Some(requested.as_str())) {
                return selected_outcome(requested);
            }
            match default_option_id(options) {
                Some(fallback) => selected_outcome(&fallback),
                None => cancelled_outcome(),
            }
        }
    }
}

pub(crate) fn request_key(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Bridge handler
// ---------------------------------------------------------------------------

pub(crate) struct RunClient {
    ctx: Weak<ProxyContext>,
    run: Weak<Run>,
}

impl RunClient {
    pub(crate) fn new(ctx: &Arc<ProxyContext>, run: &Arc<Run>) -> Self {
        Self {
            ctx: Arc::downgrade(ctx),
            run: Arc::downgrade(run),
        }
    }

    fn upgrade(&self) -> Option<(Arc<ProxyContext>, Arc<Run>)> {
        Some((self.ctx.upgrade()?, self.run.upgrade()?))
    }
}

impl BridgeHandler for RunClient {
    fn on_request(
        &self,
        id: &Value,
        method: String,
        params: Value,
    ) -> BoxFuture<'static, Result<Value, RpcError>> {
        let target = self.upgrade();
        let request_id = request_key(id);
        Box::pin(async move {
            let Some((ctx, run)) = target else {
                return Err(RpcError::internal("run closed"));
            };
            handle_agent_request(&ctx, &run, request_id, &method, params).await
        })
    }

    fn on_notification(&self, method: String, params: Value) {
        let Some((ctx, run)) = self.upgrade() else {
            return;
        };
        match method.as_str() {
            "session/update" => {
                let session_id = params.get("sessionId").and_then(Value::as_str);
                let update = params.get("update").cloned().unwrap_or(Value::Null);
                let prompt_id = run.active_prompt_id();
                ctx.send_acp_update(&run.run_id, prompt_id.as_deref(), session_id, update.clone());
                if let Some(session_id) = session_id {
                    maybe_switch_to_auto_mode(&ctx, &run, session_id, &update);
                }
            }
            "$/cancel_request" => {
                let Some(request_id) = params.get("requestId").map(request_key) else {
                    return;
                };
                if run.permissions.cancel(&request_id) {
                    tracing::info!(run_id = %run.run_id, request_id = %request_id, "permission request cancelled by agent");
                }
            }
            other => {
                tracing::debug!(run_id = %run.run_id, method = %other, "ignoring agent notification");
            }
        }
    }

    fn on_stderr(&self, line: &str, phase: StderrPhase) {
        let Some((ctx, run)) = self.upgrade() else {
            return;
        };
        match phase {
            StderrPhase::Init => match parse_init_step_line(line) {
                Some(step) => ctx.send_update(&run.run_id, step.to_content()),
                None => ctx.send_text(&run.run_id, &format!("[init:stderr] {line}")),
            },
            StderrPhase::Agent => {
                tracing::info!(run_id = %run.run_id, phase = phase.as_str(), "agent stderr: {}", line);
                ctx.send_text(&run.run_id, &format!("[agent:stderr] {line}"));
            }
        }
    }
}

async fn handle_agent_request(
    ctx: &Arc<ProxyContext>,
    run: &Arc<Run>,
    request_id: String,
    method: &str,
    params: Value,
) -> Result<Value, RpcError> {
    match method {
        "session/request_permission" => Ok(request_permission(ctx, run, request_id, params).await),
        "fs/read_text_file" => read_text_file(run, &params).await,
        "fs/write_text_file" => write_text_file(run, &params).await,
        other if other.starts_with("terminal/") => {
            Err(RpcError::new(TERMINAL_DISABLED_CODE, "terminal disabled"))
        }
        other => Err(RpcError::method_not_found(other)),
    }
}

async fn request_permission(
    ctx: &Arc<ProxyContext>,
    run: &Arc<Run>,
    request_id: String,
    params: Value,
) -> Value {
    let options = params
        .get("options")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if !ctx.sandbox.is_host_process() {
        let outcome = match default_option_id(&options) {
            Some(option_id) => selected_outcome(&option_id),
            None => cancelled_outcome(),
        };
        tracing::info!(run_id = %run.run_id, request_id = %request_id, outcome = %outcome, "permission auto-resolved");
        return outcome;
    }

    let reply = run.permissions.register(&request_id, options.clone());
    ctx.send_update(
        &run.run_id,
        json!({
            "type": "permission_request",
            "request_id": request_id,
            "session_id": params.get("sessionId").cloned().unwrap_or(Value::Null),
            "prompt_id": run.active_prompt_id(),
            "tool_call": params.get("toolCall").cloned().unwrap_or(Value::Null),
            "options": options,
        }),
    );
    reply.await.unwrap_or_else(|_| cancelled_outcome())
}

// ---------------------------------------------------------------------------
// Workspace file access
// ---------------------------------------------------------------------------

/// Accepts guest `/workspace/...` paths and, for host agents, host paths
/// under the Run's workspace directory.
fn resolve_fs_path(host_workspace: &Path, raw: &str) -> Result<PathBuf, RpcError> {
    let outside = || RpcError::new(acp_stdio_bridge::message::INVALID_PARAMS, format!("path outside workspace: {raw}"));
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(RpcError::invalid_params());
    }
    let normalized = PathBuf::from(posix_normalize(raw));
    if normalized.is_absolute() && is_descendant(host_workspace, &normalized) {
        return Ok(normalized);
    }
    guest_to_host(host_workspace, raw).map_err(|_| outside())
}

fn fs_target(run: &Run, params: &Value) -> Result<PathBuf, RpcError> {
    let path = params
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(RpcError::invalid_params)?;
    let workspace = run
        .workspace()
        .ok_or_else(|| RpcError::internal("run workspace not prepared"))?;
    resolve_fs_path(&workspace.host_workspace, path)
}

fn positive(params: &Value, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

async fn read_text_file(run: &Run, params: &Value) -> Result<Value, RpcError> {
    let path = fs_target(run, params)?;
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(RpcError::new(RESOURCE_NOT_FOUND_CODE, "resource not found"))
        }
        Err(err) => return Err(RpcError::internal(err.to_string())),
    };
    Ok(json!({ "content": slice_lines(&text, positive(params, "line"), positive(params, "limit")) }))
}

/// `line` is 1-based.
pub fn slice_lines(text: &str, line: Option<u64>, limit: Option<u64>) -> String {
    if line.is_none() && limit.is_none() {
        return text.to_string();
    }
    if limit == Some(0) {
        return String::new();
    }
    let skip = line.unwrap_or(1).saturating_sub(1) as usize;
    let lines = text.split_inclusive('\n').skip(skip);
    match limit {
        Some(limit) => lines.take(limit as usize).collect(),
        None => lines.collect(),
    }
}

async fn write_text_file(run: &Run, params: &Value) -> Result<Value, RpcError> {
    let path = fs_target(run, params)?;
    let content = params
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(RpcError::invalid_params)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| RpcError::internal(err.to_string()))?;
    }
    tokio::fs::write(&path, content)
        .await
        .map_err(|err| RpcError::internal(err.to_string()))?;
    tracing::debug!(run_id = %run.run_id, path = %path.display(), bytes = content.len(), "agent wrote file");
    Ok(json!({}))
}

// ---------------------------------------------------------------------------
// Auto mode
// ---------------------------------------------------------------------------

/// A `config_option_update` whose `mode` option offers `auto` but currently
/// holds something else.
pub fn wants_auto_mode(update: &Value) -> bool {
    if update.get("sessionUpdate").and_then(Value::as_str) != Some("config_option_update") {
        return false;
    }
    let Some(mode) = update
        .get("configOptions")
        .and_then(Value::as_array)
        .and_then(|options| {
            options
                .iter()
                .find(|option| option.get("id").and_then(Value::as_str) == Some("mode"))
        })
    else {
        return false;
    };
    if mode.get("currentValue").and_then(Value::as_str) == Some("auto") {
        return false;
    }
    let values = mode.get("options").and_then(Value::as_array);
    values.is_some_and(|values| {
        values.iter().any(|value| {
            value.get("value").and_then(Value::as_str) == Some("auto")
                || value
                    .get("options")
                    .and_then(Value::as_array)
                    .is_some_and(|group| {
                        group
                            .iter()
                            .any(|value| value.get("value").and_then(Value::as_str) == Some("auto"))
                    })
        })
    })
}

/// Host agents run without a reviewer; switch each session to `auto` once.
pub(crate) fn maybe_switch_to_auto_mode(
    ctx: &Arc<ProxyContext>,
    run: &Arc<Run>,
    session_id: &str,
    update: &Value,
) {
    if !ctx.sandbox.is_host_process() || !wants_auto_mode(update) || !run.claim_auto_mode(session_id) {
        return;
    }
    let run = run.clone();
    let session_id = session_id.to_string();
    tokio::spawn(async move {
        let params = json!({ "sessionId": session_id, "configId": "mode", "value": "auto" });
        let result = with_auth_retry(&run, |bridge| {
            let params = params.clone();
            async move {
                bridge
                    .send_rpc("session/set_config_option", params, None)
                    .await
                    .map_err(map_bridge_error)
            }
        })
        .await;
        match result {
            Ok(_) => tracing::info!(run_id = %run.run_id, session_id = %session_id, "session mode switched to auto"),
            Err(err) => tracing::warn!(run_id = %run.run_id, session_id = %session_id, error = %err, "failed to switch session mode to auto"),
        }
    });
}
