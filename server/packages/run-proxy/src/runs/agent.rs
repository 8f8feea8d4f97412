use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use acp_stdio_bridge::{AgentBridge, BridgeOptions, ExitInfo, DEFAULT_RPC_TIMEOUT, INIT_MARKER_PREFIX};
use run_proxy_error::RuntimeError;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::proxy::ProxyContext;
use crate::sandbox::{AgentMode, InstanceStatus, OpenAgentOpts, WORKSPACE_GUEST_ROOT};
use crate::secrets::SecretSet;

use super::client::RunClient;
use super::init::{allowed_env, init_result_content, RunInit};
use super::retry::map_bridge_error;
use super::Run;

pub const ACP_PROTOCOL_VERSION: u64 = 1;

/// What `start_agent` needs when `ensure_initialized` has to spawn.
#[derive(Debug, Clone, Copy)]
pub struct AgentLaunch<'a> {
    pub init: &'a RunInit,
    pub env: &'a BTreeMap<String, String>,
    pub secrets: &'a SecretSet,
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": ACP_PROTOCOL_VERSION,
        "clientInfo": {
            "name": "run-proxy",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "clientCapabilities": {
            "fs": { "readTextFile": true, "writeTextFile": true },
            "terminal": false,
        },
    })
}

/// Drops every agent-scoped field of the Run, then terminates the process.
/// Pending RPCs and permission prompts fail.
pub async fn close_agent(run: &Run, reason: &str) {
    let bridge = {
        let mut state = run.state();
        state.init_result = None;
        state.seen_sessions.clear();
        state.auto_mode_sessions.clear();
        state.active_prompt_id = None;
        state.bridge.take()
    };
    run.permissions.cancel_all();
    let Some(bridge) = bridge else {
        return;
    };
    bridge.close().await;
    tracing::info!(run_id = %run.run_id, reason = %reason, pid = bridge.pid().unwrap_or(0), "agent closed");
}

/// Spawns the agent for `run` and wires its bridge. A Run with a live
/// bridge is left alone and a closed Run never gets an agent.
pub async fn start_agent(
    ctx: &Arc<ProxyContext>,
    run: &Arc<Run>,
    init: &RunInit,
    env: &BTreeMap<String, String>,
    secrets: &SecretSet,
) -> Result<(), RuntimeError> {
    run.ensure_open()?;
    if run.bridge().is_some() {
        return Ok(());
    }

    let agent_env = allowed_env(&ctx.config, &run.run_id, env);
    let entrypoint = ctx.sandbox.agent_mode() == AgentMode::Entrypoint;
    if entrypoint {
        let before = ctx.sandbox.inspect_instance(&run.instance_name).await?;
        if before.status == InstanceStatus::Missing || init.script.is_some() {
            ctx.send_instance_status(&run.run_id, &run.instance_name, InstanceStatus::Creating, None);
        }
        if init.script.is_some() {
            ctx.send_text(
                &run.run_id,
                &format!("[init] start (bash, timeout={}s)", init.timeout.as_secs()),
            );
        }
    }

    let mounts = run.workspace().map(|workspace| workspace.mounts).unwrap_or_default();
    let opened = ctx
        .sandbox
        .open_agent(&OpenAgentOpts {
            run_id: run.run_id.clone(),
            instance_name: run.instance_name.clone(),
            workspace_guest_path: WORKSPACE_GUEST_ROOT.to_string(),
            mounts,
            agent_command: ctx.config.agent_command.clone(),
            env: agent_env.clone(),
            init: init.init_spec(&agent_env),
        })
        .await?;
    let init_pending = entrypoint && opened.init_pending;

    let mut secrets = secrets.clone();
    secrets.add_env(&agent_env);
    let options = BridgeOptions {
        rpc_timeout: DEFAULT_RPC_TIMEOUT,
        init_marker: init_pending.then(|| INIT_MARKER_PREFIX.to_string()),
        redact: Some(secrets.redactor()),
    };
    let client = Arc::new(RunClient::new(ctx, run));
    let bridge = AgentBridge::start(opened.handle, options, client).map_err(map_bridge_error)?;

    let generation = {
        let mut state = run.state();
        state.bridge = Some(bridge.clone());
        state.init_result = None;
        state.agent_generation += 1;
        state.agent_generation
    };
    // Closed while the agent was being opened.
    if run.is_closed() {
        close_agent(run, "run_closed").await;
        return Err(RuntimeError::RunClosed {
            run_id: run.run_id.clone(),
        });
    }
    tracing::info!(
        run_id = %run.run_id,
        instance_name = %run.instance_name,
        pid = bridge.pid().unwrap_or(0),
        generation,
        created = opened.created,
        init_pending,
        "agent started"
    );

    let awaiting_init = Arc::new(AtomicBool::new(init_pending));
    tokio::spawn(watch_agent_exit(
        Arc::downgrade(ctx),
        Arc::downgrade(run),
        bridge.exit_watch(),
        generation,
        awaiting_init.clone(),
    ));

    ctx.send_update(
        &run.run_id,
        json!({
            "type": "transport_connected",
            "instance_name": run.instance_name,
            "at": crate::sandbox::now_rfc3339(),
        }),
    );
    ctx.report_instance_status(&run.run_id, &run.instance_name).await;

    if !init_pending {
        return Ok(());
    }

    let failure = match bridge.wait_for_init_result(init.timeout).await {
        Ok(outcome) if outcome.ok => None,
        Ok(outcome) => Some((
            outcome.exit_code,
            outcome
                .exit_code
                .map(|code| format!("exitCode={code}"))
                .unwrap_or_else(|| "init_failed".to_string()),
        )),
        Err(err) => Some((None, err.to_string())),
    };
    if let Some((exit_code, error)) = failure {
        tracing::warn!(run_id = %run.run_id, error = %error, "entrypoint init failed");
        ctx.send_update(&run.run_id, init_result_content(false, exit_code, Some(&error)));
        close_agent(run, "init_failed").await;
        if let Err(err) = ctx.sandbox.remove_instance(&run.instance_name).await {
            tracing::warn!(run_id = %run.run_id, error = %err, "failed to remove instance after init failure");
        }
        return Err(RuntimeError::InitFailed { detail: Some(error) });
    }

    awaiting_init.store(false, Ordering::SeqCst);
    ctx.send_update(&run.run_id, init_result_content(true, None, None));
    ctx.send_text(&run.run_id, "[init] done");
    Ok(())
}

async fn watch_agent_exit(
    ctx: Weak<ProxyContext>,
    run: Weak<Run>,
    mut exit: watch::Receiver<Option<ExitInfo>>,
    generation: u64,
    awaiting_init: Arc<AtomicBool>,
) {
    let waited = exit.wait_for(Option::is_some).await.map(|info| *info);
    let info = match waited {
        Ok(info) => info.unwrap_or_default(),
        Err(_) => exit.borrow().unwrap_or_default(),
    };
    let (Some(ctx), Some(run)) = (ctx.upgrade(), run.upgrade()) else {
        return;
    };
    // A failed entrypoint init reports itself; a newer agent owns the Run.
    if awaiting_init.load(Ordering::SeqCst) || run.agent_generation() != generation {
        return;
    }

    tracing::info!(
        run_id = %run.run_id,
        instance_name = %run.instance_name,
        code = ?info.code,
        signal = ?info.signal,
        "agent exited"
    );
    ctx.send_update(
        &run.run_id,
        json!({
            "type": "transport_disconnected",
            "instance_name": run.instance_name,
            "code": info.code,
            "signal": info.signal,
            "at": crate::sandbox::now_rfc3339(),
            "reason": "agent_exit",
        }),
    );
    close_agent(&run, "agent_exit").await;
    ctx.send(json!({
        "type": "acp_exit",
        "run_id": run.run_id,
        "instance_name": run.instance_name,
        "code": info.code,
        "signal": info.signal,
    }));
}

/// Single-flight `initialize`. Concurrent callers wait on the Run's init
/// gate and observe exactly one spawn and one handshake; the result stays
/// cached until the agent is closed.
pub async fn ensure_initialized(
    ctx: &Arc<ProxyContext>,
    run: &Arc<Run>,
    launch: Option<AgentLaunch<'_>>,
) -> Result<Value, RuntimeError> {
    if run.is_initialized() {
        if let Some(result) = run.init_result() {
            return Ok(result);
        }
    }

    let _gate = run.init_gate.lock().await;
    if run.is_initialized() {
        if let Some(result) = run.init_result() {
            return Ok(result);
        }
    }

    if run.bridge().is_none() {
        let Some(launch) = launch else {
            return Err(RuntimeError::AgentNotConnected);
        };
        start_agent(ctx, run, launch.init, launch.env, launch.secrets).await?;
    }
    let bridge = run.bridge().ok_or(RuntimeError::AgentNotConnected)?;
    let generation = run.agent_generation();

    let started = tokio::time::Instant::now();
    let result = bridge
        .send_rpc("initialize", initialize_params(), None)
        .await
        .map_err(map_bridge_error)?;
    {
        let mut state = run.state();
        if state.agent_generation == generation && state.bridge.is_some() {
            state.init_result = Some(result.clone());
        }
    }
    let auth_methods = result
        .get("authMethods")
        .and_then(Value::as_array)
        .map_or(0, |methods| methods.len());
    tracing::info!(
        run_id = %run.run_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        auth_methods = auth_methods,
        "agent initialized"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_advertises_fs_only() {
        let params = initialize_params();
        assert_eq!(params["protocolVersion"], json!(1));
        assert_eq!(params["clientInfo"]["name"], json!("run-proxy"));
        assert_eq!(
            params["clientCapabilities"],
            json!({ "fs": { "readTextFile": true, "writeTextFile": true }, "terminal": false })
        );
    }
}
