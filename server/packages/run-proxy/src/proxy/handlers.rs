//! Run-level commands: open, close, prompt, session controls and
//! permission replies. Every command that carries an id gets exactly one
//! result message.

use std::sync::Arc;

use run_proxy_error::RuntimeError;
use serde_json::{json, Value};

use crate::runs::client::request_key;
use crate::runs::{
    close_agent, ensure_initialized, ensure_run_open, ensure_runtime, map_bridge_error, send_prompt,
    with_auth_retry, PermissionChoice, PromptOutcome, Run, RuntimeRequest, SessionTarget,
};
use crate::sandbox::WORKSPACE_GUEST_ROOT;
use crate::validate::{non_empty_str, prompt_timeout, validate_run_id};

use super::{LaneSlot, ProxyContext};

fn merge(mut base: Value, payload: Value) -> Value {
    if let (Some(base), Value::Object(payload)) = (base.as_object_mut(), payload) {
        base.extend(payload);
    }
    base
}

// ---------------------------------------------------------------------------
// acp_open / acp_close
// ---------------------------------------------------------------------------

/// Waits for the command's slot, then for the Run it addresses once it is
/// resolved. A close that arrived in between refuses the command and drops
/// the Run it just created.
async fn resolve_in_turn(
    ctx: &Arc<ProxyContext>,
    req: &RuntimeRequest,
    slot: Option<&LaneSlot>,
) -> Result<Arc<Run>, RuntimeError> {
    if let Some(slot) = slot {
        slot.wait_turn().await?;
    }
    let run = ensure_runtime(ctx, req).await?;
    if let Some(slot) = slot {
        if let Err(err) = slot.check_current() {
            ctx.runs.remove(&run).await;
            return Err(err);
        }
    }
    Ok(run)
}

pub async fn acp_open(ctx: Arc<ProxyContext>, msg: Value, slot: Option<LaneSlot>) {
    let Some(run_id) = non_empty_str(msg.get("run_id")).map(str::to_string) else {
        tracing::warn!("acp_open without run_id");
        return;
    };
    match open_run(&ctx, &msg, slot.as_ref()).await {
        Ok(()) => {
            tracing::info!(run_id = %run_id, "run opened");
            ctx.send(json!({ "type": "acp_opened", "run_id": run_id, "ok": true }));
        }
        Err(err) => {
            let error = ctx.secrets.redact(&err.to_string());
            tracing::warn!(run_id = %run_id, error = %error, error_type = err.error_type().as_code(), "acp_open failed");
            ctx.send(json!({ "type": "acp_opened", "run_id": run_id, "ok": false, "error": error }));
        }
    }
}

async fn open_run(ctx: &Arc<ProxyContext>, msg: &Value, slot: Option<&LaneSlot>) -> Result<(), RuntimeError> {
    let req = RuntimeRequest::from_message(msg)?;
    let run = resolve_in_turn(ctx, &req, slot).await?;
    run.enqueue(ensure_run_open(ctx, &run, &req.init)).await
}

pub async fn acp_close(ctx: Arc<ProxyContext>, msg: Value) {
    let run_id = match validate_run_id(msg.get("run_id")) {
        Ok(run_id) => run_id,
        Err(err) => {
            tracing::warn!(error = %err, "acp_close rejected");
            return;
        }
    };
    // Not queued: the agent goes down now and an in-flight prompt fails
    // with its pending RPCs.
    if let Some(run) = ctx.runs.get(&run_id).await {
        run.mark_closed();
        close_agent(&run, "acp_close").await;
        ctx.runs.remove(&run).await;
    }
    ctx.send(json!({ "type": "acp_closed", "run_id": run_id, "ok": true }));
}

// ---------------------------------------------------------------------------
// prompt_send
// ---------------------------------------------------------------------------

pub fn prompt_result(run_id: &str, prompt_id: Option<&str>, result: &Result<PromptOutcome, String>) -> Value {
    let base = json!({ "type": "prompt_result", "run_id": run_id, "prompt_id": prompt_id });
    match result {
        Ok(outcome) => merge(
            base,
            json!({
                "ok": true,
                "session_id": outcome.session_id,
                "stop_reason": outcome.stop_reason,
                "session_created": outcome.session_created,
                "session_recreated_from": outcome.session_recreated_from,
            }),
        ),
        Err(error) => merge(base, json!({ "ok": false, "error": error })),
    }
}

pub async fn prompt_send(ctx: Arc<ProxyContext>, msg: Value, slot: Option<LaneSlot>) {
    let Some(run_id) = non_empty_str(msg.get("run_id")).map(str::to_string) else {
        tracing::warn!("prompt_send without run_id");
        return;
    };
    let prompt_id = non_empty_str(msg.get("prompt_id")).map(str::to_string);
    let started = tokio::time::Instant::now();

    let result = match &prompt_id {
        Some(prompt_id) => run_prompt(&ctx, &msg, prompt_id, slot.as_ref()).await,
        None => Err(RuntimeError::invalid("prompt_id empty")),
    };
    let result = result.map_err(|err| {
        let error = ctx.secrets.redact(&err.to_string());
        tracing::warn!(
            run_id = %run_id,
            prompt_id = ?prompt_id,
            error = %error,
            error_type = err.error_type().as_code(),
            "prompt failed"
        );
        error
    });
    if let Ok(outcome) = &result {
        tracing::info!(
            run_id = %run_id,
            prompt_id = ?prompt_id,
            session_id = %outcome.session_id,
            stop_reason = ?outcome.stop_reason,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "prompt done"
        );
    }
    ctx.send(prompt_result(&run_id, prompt_id.as_deref(), &result));
}

async fn run_prompt(
    ctx: &Arc<ProxyContext>,
    msg: &Value,
    prompt_id: &str,
    slot: Option<&LaneSlot>,
) -> Result<PromptOutcome, RuntimeError> {
    let prompt = msg
        .get("prompt")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| RuntimeError::invalid("prompt must be an array"))?;
    let req = RuntimeRequest::from_message(msg)?;
    let run = resolve_in_turn(ctx, &req, slot).await?;

    let target = SessionTarget {
        cwd: req
            .cwd
            .clone()
            .or_else(|| run.default_cwd())
            .unwrap_or_else(|| WORKSPACE_GUEST_ROOT.to_string()),
        session_id: non_empty_str(msg.get("session_id")).map(str::to_string),
        context: msg.get("context").and_then(Value::as_str).map(str::to_string),
        prompt,
    };
    let timeout = prompt_timeout(msg.get("timeout_ms"));

    run.enqueue(async {
        ensure_run_open(ctx, &run, &req.init).await?;
        run.set_active_prompt_id(Some(prompt_id.to_string()));
        let outcome = send_prompt(ctx, &run, &target, prompt_id, timeout).await;
        run.set_active_prompt_id(None);
        outcome
    })
    .await
}

// ---------------------------------------------------------------------------
// Session controls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Cancel,
    SetMode,
    SetModel,
}

impl SessionControl {
    pub fn from_type(kind: &str) -> Option<Self> {
        match kind {
            "session_cancel" => Some(Self::Cancel),
            "session_set_mode" => Some(Self::SetMode),
            "session_set_model" => Some(Self::SetModel),
            _ => None,
        }
    }

    /// Message field carrying the target id and the RPC param it maps to.
    fn argument(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Cancel => None,
            Self::SetMode => Some(("mode_id", "modeId")),
            Self::SetModel => Some(("model_id", "modelId")),
        }
    }

    fn method(&self) -> &'static str {
        match self {
            Self::Cancel => "session/cancel",
            Self::SetMode => "session/set_mode",
            Self::SetModel => "session/set_model",
        }
    }
}

/// Bypasses the Run queue so a cancel can reach a prompt in flight.
pub async fn session_control(ctx: Arc<ProxyContext>, control: SessionControl, msg: Value) {
    let run_id = non_empty_str(msg.get("run_id")).unwrap_or_default().to_string();
    let control_id = non_empty_str(msg.get("control_id")).unwrap_or_default().to_string();
    let result = apply_session_control(&ctx, control, &run_id, &control_id, &msg).await;
    let mut reply = json!({
        "type": "session_control_result",
        "run_id": run_id,
        "control_id": control_id,
        "ok": result.is_ok(),
    });
    if let Err(err) = result {
        tracing::warn!(run_id = %run_id, control_id = %control_id, method = control.method(), error = %err, "session control failed");
        reply["error"] = json!(err.to_string());
    }
    ctx.send(reply);
}

async fn apply_session_control(
    ctx: &Arc<ProxyContext>,
    control: SessionControl,
    run_id: &str,
    control_id: &str,
    msg: &Value,
) -> Result<(), RuntimeError> {
    if control_id.is_empty() {
        return Err(RuntimeError::invalid("control_id empty"));
    }
    let session_id = non_empty_str(msg.get("session_id"))
        .ok_or_else(|| RuntimeError::invalid("session_id empty"))?
        .to_string();
    let mut params = json!({ "sessionId": session_id });
    if let Some((field, param)) = control.argument() {
        let value = non_empty_str(msg.get(field))
            .ok_or_else(|| RuntimeError::invalid(format!("{field} empty")))?;
        params[param] = json!(value);
    }

    let run = match ctx.runs.get(run_id).await {
        Some(run) if run.bridge().is_some() => run,
        _ => {
            return Err(RuntimeError::RunNotOpen {
                run_id: run_id.to_string(),
            })
        }
    };

    if control == SessionControl::Cancel {
        let bridge = run.bridge().ok_or(RuntimeError::AgentNotConnected)?;
        return bridge
            .send_notification(control.method(), params)
            .await
            .map_err(map_bridge_error);
    }

    ensure_initialized(ctx, &run, None).await?;
    with_auth_retry(&run, |bridge| {
        let params = params.clone();
        async move {
            bridge
                .send_rpc(control.method(), params, None)
                .await
                .map_err(map_bridge_error)
        }
    })
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// session_permission
// ---------------------------------------------------------------------------

pub fn permission_choice(msg: &Value) -> PermissionChoice {
    let outcome = msg
        .get("outcome")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    match (outcome.as_str(), non_empty_str(msg.get("option_id"))) {
        ("selected", Some(option_id)) => PermissionChoice::Selected(option_id.to_string()),
        ("selected", None) => PermissionChoice::Selected(String::new()),
        _ => PermissionChoice::Cancelled,
    }
}

pub async fn session_permission(ctx: Arc<ProxyContext>, msg: Value) {
    let Some(run_id) = non_empty_str(msg.get("run_id")) else {
        return;
    };
    let Some(request_id) = msg
        .get("request_id")
        .filter(|id| !id.is_null())
        .map(request_key)
        .filter(|id| !id.trim().is_empty())
    else {
        tracing::warn!(run_id = %run_id, "session_permission without request_id");
        return;
    };
    let Some(run) = ctx.runs.get(run_id).await else {
        tracing::warn!(run_id = %run_id, request_id = %request_id, "session_permission for unknown run");
        return;
    };
    let choice = permission_choice(&msg);
    if run.permissions.resolve(&request_id, &choice) {
        tracing::info!(run_id = %run_id, request_id = %request_id, choice = ?choice, "permission resolved");
    } else {
        tracing::warn!(run_id = %run_id, request_id = %request_id, "session_permission matched no pending request");
    }
}
