use std::sync::Arc;
use std::time::Duration;

use run_proxy_error::RuntimeError;
use serde_json::{json, Value};

use crate::proxy::ProxyContext;
use crate::sandbox::{normalize_guest_cwd, SandboxProvider};

use super::client::maybe_switch_to_auto_mode;
use super::retry::{classify_error, map_bridge_error, with_auth_retry, ErrorClass};
use super::Run;

pub const CONTEXT_RESOURCE_URI: &str = "run-proxy://context";

const CONTEXT_INTRO: &str = "The previous agent session for this run is no longer available. \
The conversation so far is summarized below; treat it as history and continue from where it left off.";
const CONTEXT_START: &str = "=== context start ===";
const CONTEXT_END: &str = "=== context end ===";
const USER_MESSAGE: &str = "user message:";

/// What the agent said it accepts in `initialize`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptCapabilities {
    pub image: bool,
    pub audio: bool,
    pub embedded_context: bool,
    pub load_session: bool,
}

impl PromptCapabilities {
    pub fn from_init_result(init_result: Option<&Value>) -> Self {
        let agent = init_result.and_then(|init| init.get("agentCapabilities"));
        let prompt = agent.and_then(|agent| agent.get("promptCapabilities"));
        let flag = |value: Option<&Value>, key: &str| {
            value
                .and_then(|value| value.get(key))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        Self {
            image: flag(prompt, "image"),
            audio: flag(prompt, "audio"),
            embedded_context: flag(prompt, "embeddedContext"),
            load_session: flag(agent, "loadSession"),
        }
    }
}

/// Rejects blocks the agent did not opt into before anything is sent.
pub fn check_prompt_blocks(prompt: &[Value], caps: &PromptCapabilities) -> Result<(), RuntimeError> {
    for block in prompt {
        let Some(block_type) = block.get("type").and_then(Value::as_str) else {
            return Err(RuntimeError::invalid("prompt block missing type"));
        };
        let (allowed, capability) = match block_type {
            "text" | "resource_link" => continue,
            "image" => (caps.image, "image"),
            "audio" => (caps.audio, "audio"),
            "resource" => (caps.embedded_context, "embeddedContext"),
            other => {
                return Err(RuntimeError::invalid(format!(
                    "unsupported prompt block type: {other}"
                )))
            }
        };
        if !allowed {
            return Err(RuntimeError::CapabilityMismatch {
                block_type: block_type.to_string(),
                capability: capability.to_string(),
            });
        }
    }
    Ok(())
}

/// Prefixes `prompt` with the recovery preamble. An empty context leaves the
/// prompt untouched.
pub fn compose_prompt_with_context(
    prompt: &[Value],
    context: Option<&str>,
    caps: &PromptCapabilities,
) -> Vec<Value> {
    let Some(context) = context.map(str::trim).filter(|context| !context.is_empty()) else {
        return prompt.to_vec();
    };

    let mut composed = if caps.embedded_context {
        vec![
            json!({ "type": "text", "text": format!("{CONTEXT_INTRO}\n{CONTEXT_START}") }),
            json!({
                "type": "resource",
                "resource": {
                    "uri": CONTEXT_RESOURCE_URI,
                    "mimeType": "text/markdown",
                    "text": context,
                }
            }),
            json!({ "type": "text", "text": format!("{CONTEXT_END}\n\n{USER_MESSAGE}") }),
        ]
    } else {
        vec![json!({
            "type": "text",
            "text": format!("{CONTEXT_INTRO}\n{CONTEXT_START}\n{context}\n{CONTEXT_END}\n\n{USER_MESSAGE}"),
        })]
    };
    composed.extend(prompt.iter().cloned());
    composed
}

#[derive(Debug, Clone, Default)]
pub struct SessionTarget {
    /// Guest path; `/workspace` when the command gives none.
    pub cwd: String,
    pub session_id: Option<String>,
    pub context: Option<String>,
    pub prompt: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnsuredSession {
    pub session_id: String,
    pub prompt: Vec<Value>,
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptOutcome {
    pub session_id: String,
    pub stop_reason: Option<String>,
    pub session_created: bool,
    pub session_recreated_from: Option<String>,
}

/// The cwd as the agent process sees it.
async fn session_cwd(ctx: &ProxyContext, run: &Run, guest_cwd: &str) -> Result<String, RuntimeError> {
    match &ctx.sandbox {
        SandboxProvider::HostProcess(sandbox) => {
            let host = sandbox.host_cwd(&run.instance_name, guest_cwd).await?;
            Ok(host.display().to_string())
        }
        _ => Ok(normalize_guest_cwd(guest_cwd)?),
    }
}

pub async fn create_session(
    ctx: &Arc<ProxyContext>,
    run: &Arc<Run>,
    cwd: &str,
    prompt_id: Option<&str>,
) -> Result<String, RuntimeError> {
    let params = json!({ "cwd": cwd, "mcpServers": [] });
    let result = with_auth_retry(run, |bridge| {
        let params = params.clone();
        async move {
            bridge
                .send_rpc("session/new", params, None)
                .await
                .map_err(map_bridge_error)
        }
    })
    .await?;

    let session_id = result
        .get("sessionId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| RuntimeError::stream("session/new returned no sessionId"))?
        .to_string();
    run.mark_session_seen(&session_id);
    tracing::info!(run_id = %run.run_id, session_id = %session_id, cwd = %cwd, "session created");

    ctx.send_acp_update(
        &run.run_id,
        prompt_id,
        Some(&session_id),
        json!({ "sessionUpdate": "session_created", "content": { "type": "session_created" } }),
    );
    if let Some(options) = result.get("configOptions").filter(|options| options.is_array()) {
        let update = json!({ "sessionUpdate": "config_option_update", "configOptions": options });
        ctx.send_acp_update(&run.run_id, prompt_id, Some(&session_id), update.clone());
        maybe_switch_to_auto_mode(ctx, run, &session_id, &update);
    }
    Ok(session_id)
}

pub async fn ensure_session_for_prompt(
    ctx: &Arc<ProxyContext>,
    run: &Arc<Run>,
    target: &SessionTarget,
    prompt_id: Option<&str>,
) -> Result<EnsuredSession, RuntimeError> {
    let caps = PromptCapabilities::from_init_result(run.init_result().as_ref());
    check_prompt_blocks(&target.prompt, &caps)?;
    let cwd = session_cwd(ctx, run, &target.cwd).await?;

    let Some(session_id) = target.session_id.clone() else {
        let session_id = create_session(ctx, run, &cwd, prompt_id).await?;
        return Ok(EnsuredSession {
            session_id,
            prompt: compose_prompt_with_context(&target.prompt, target.context.as_deref(), &caps),
            created: true,
        });
    };

    if !run.has_seen_session(&session_id) {
        run.mark_session_seen(&session_id);
        if caps.load_session {
            let params = json!({ "sessionId": session_id, "cwd": cwd, "mcpServers": [] });
            let loaded = with_auth_retry(run, |bridge| {
                let params = params.clone();
                async move {
                    bridge
                        .send_rpc("session/load", params, None)
                        .await
                        .map_err(map_bridge_error)
                }
            })
            .await;
            match loaded {
                Ok(_) => tracing::info!(run_id = %run.run_id, session_id = %session_id, "session loaded"),
                Err(err) => tracing::warn!(
                    run_id = %run.run_id,
                    session_id = %session_id,
                    error = %err,
                    "session/load failed; continuing with the supplied id"
                ),
            }
        }
    }
    Ok(EnsuredSession {
        session_id,
        prompt: target.prompt.clone(),
        created: false,
    })
}

async fn prompt_once(
    run: &Run,
    session_id: &str,
    prompt: &[Value],
    timeout: Duration,
) -> Result<Option<String>, RuntimeError> {
    let params = json!({ "sessionId": session_id, "prompt": prompt });
    let result = with_auth_retry(run, |bridge| {
        let params = params.clone();
        async move {
            bridge
                .send_rpc("session/prompt", params, Some(timeout))
                .await
                .map_err(map_bridge_error)
        }
    })
    .await?;
    Ok(result
        .get("stopReason")
        .and_then(Value::as_str)
        .map(str::to_string))
}

/// Sends the prompt. A session-related failure discards the session,
/// creates a new one in the same cwd and replays the prompt with context,
/// exactly once.
pub async fn send_prompt(
    ctx: &Arc<ProxyContext>,
    run: &Arc<Run>,
    target: &SessionTarget,
    prompt_id: &str,
    timeout: Duration,
) -> Result<PromptOutcome, RuntimeError> {
    let ensured = ensure_session_for_prompt(ctx, run, target, Some(prompt_id)).await?;
    let err = match prompt_once(run, &ensured.session_id, &ensured.prompt, timeout).await {
        Ok(stop_reason) => {
            return Ok(PromptOutcome {
                session_id: ensured.session_id,
                stop_reason,
                session_created: ensured.created,
                session_recreated_from: None,
            })
        }
        Err(err) => err,
    };
    if classify_error(&err) != ErrorClass::SessionInvalid {
        return Err(err);
    }

    let stale = ensured.session_id;
    tracing::warn!(
        run_id = %run.run_id,
        session_id = %stale,
        error = %err,
        "session rejected by agent; recreating"
    );
    run.forget_session(&stale);

    let caps = PromptCapabilities::from_init_result(run.init_result().as_ref());
    let cwd = session_cwd(ctx, run, &target.cwd).await?;
    let session_id = create_session(ctx, run, &cwd, Some(prompt_id)).await?;
    let prompt = compose_prompt_with_context(&target.prompt, target.context.as_deref(), &caps);
    check_prompt_blocks(&prompt, &caps)?;
    let stop_reason = prompt_once(run, &session_id, &prompt, timeout).await?;
    Ok(PromptOutcome {
        session_id,
        stop_reason,
        session_created: true,
        session_recreated_from: Some(stale),
    })
}
