use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ProxyConfig;
use crate::link::LinkHandler;
use crate::runs::close_agent;
use crate::sandbox::{now_rfc3339, InstanceStatus, SandboxProvider};

use super::sandbox_control::inventory_message;
use super::ProxyContext;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn is_wsl() -> bool {
    cfg!(target_os = "linux")
        && (std::env::var_os("WSL_DISTRO_NAME").is_some() || std::env::var_os("WSL_INTEROP").is_some())
}

fn object_at(value: Option<&Value>) -> Map<String, Value> {
    value.and_then(Value::as_object).cloned().unwrap_or_default()
}

/// `register_agent`, with the configured capabilities extended by what this
/// host and provider actually offer.
pub fn register_agent_message(config: &ProxyConfig, agent_id: &str, sandbox: &SandboxProvider) -> Value {
    let mut capabilities = object_at(config.agent.capabilities.as_ref());

    let mut runtime = object_at(capabilities.get("runtime"));
    runtime.insert("platform".to_string(), json!(std::env::consts::OS));
    runtime.insert("arch".to_string(), json!(std::env::consts::ARCH));
    runtime.insert("isWsl".to_string(), json!(is_wsl()));

    let mut sandbox_caps = object_at(capabilities.get("sandbox"));
    sandbox_caps.insert("provider".to_string(), json!(sandbox.name()));
    sandbox_caps.insert("agentMode".to_string(), json!(sandbox.agent_mode().as_str()));
    sandbox_caps.insert("terminalEnabled".to_string(), json!(config.sandbox.terminal_enabled));
    sandbox_caps.insert("image".to_string(), json!(config.sandbox.image));
    sandbox_caps.insert("workingDir".to_string(), json!(config.sandbox.working_dir));
    if let Some(runtime) = sandbox.runtime() {
        sandbox_caps.insert("runtime".to_string(), json!(runtime));
    }

    capabilities.insert("runtime".to_string(), Value::Object(runtime));
    capabilities.insert("sandbox".to_string(), Value::Object(sandbox_caps));
    capabilities.insert("acpTunnel".to_string(), json!(true));

    json!({
        "type": "register_agent",
        "agent": {
            "id": agent_id,
            "name": config.agent.name.clone().unwrap_or_else(|| agent_id.to_string()),
            "max_concurrent": config.agent.max_concurrent,
            "capabilities": capabilities,
        },
    })
}

pub fn heartbeat_message(agent_id: &str) -> Value {
    json!({ "type": "heartbeat", "agent_id": agent_id, "timestamp": now_rfc3339() })
}

// ---------------------------------------------------------------------------
// Keepalive sweeper
// ---------------------------------------------------------------------------

/// Tears down every idle Run past its keepalive: agent, instance and entry.
pub async fn sweep_expired(ctx: &ProxyContext) -> usize {
    let now = Instant::now();
    let expired = ctx.runs.expired(now).await;
    let count = expired.len();
    for run in expired {
        if !run.is_expired(Instant::now()) || ctx.lanes.is_active(&run.run_id) {
            continue;
        }
        tracing::info!(
            run_id = %run.run_id,
            instance_name = %run.instance_name,
            idle_ms = run.idle_for(now).as_millis() as u64,
            "run keepalive expired"
        );
        run.mark_closed();
        close_agent(&run, "keepalive_expired").await;
        if let Err(err) = ctx.sandbox.remove_instance(&run.instance_name).await {
            tracing::warn!(run_id = %run.run_id, instance_name = %run.instance_name, error = %err, "sandbox remove failed");
        }
        ctx.send_instance_status(&run.run_id, &run.instance_name, InstanceStatus::Missing, None);
        ctx.runs.remove(&run).await;
    }
    count
}

pub fn spawn_sweeper(ctx: Arc<ProxyContext>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_expired(&ctx).await;
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Link handler
// ---------------------------------------------------------------------------

pub struct ProxyLink {
    ctx: Arc<ProxyContext>,
}

impl ProxyLink {
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        Self { ctx }
    }
}

impl LinkHandler for ProxyLink {
    fn on_connected(&self, generation: u64) -> BoxFuture<'static, Vec<Value>> {
        let ctx = self.ctx.clone();
        Box::pin(async move {
            ctx.set_link_generation(generation);
            let mut greeting = vec![register_agent_message(&ctx.config, &ctx.agent_id, &ctx.sandbox)];
            match inventory_message(&ctx, None).await {
                Ok(inventory) => greeting.push(inventory),
                Err(err) => tracing::warn!(error = %err, "report inventory failed"),
            }
            tracing::info!(agent_id = %ctx.agent_id, generation, "connected & registered");
            greeting
        })
    }

    fn on_message(&self, message: Value) {
        self.ctx.dispatch(message);
    }

    fn on_disconnected(&self, generation: u64) {
        self.ctx.fail_controls(generation);
    }

    fn heartbeat(&self) -> Value {
        heartbeat_message(&self.ctx.agent_id)
    }
}
