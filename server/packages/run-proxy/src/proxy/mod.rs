//! The proxy proper: shared context, outbound message helpers and the
//! inbound command dispatch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use run_proxy_agent_inputs::default_cache_dir;
use run_proxy_error::RuntimeError;
use serde_json::{json, Value};
use tokio::task::AbortHandle;

use crate::config::ProxyConfig;
use crate::link::Outbox;
use crate::runs::RunManager;
use crate::sandbox::{now_rfc3339, InstanceStatus, SandboxProvider};
use crate::secrets::SecretSet;
use crate::validate::non_empty_str;

pub mod handlers;
pub mod lanes;
pub mod lifecycle;
pub mod sandbox_control;

pub use lanes::{LaneSlot, RunLanes};
pub use lifecycle::{heartbeat_message, register_agent_message, spawn_sweeper, ProxyLink, SWEEP_INTERVAL};
pub use sandbox_control::{inventory_message, SandboxAction};

/// A `sandbox_control` request running on behalf of one link connection.
struct PendingControl {
    generation: u64,
    abort: AbortHandle,
    reply: Value,
}

pub struct ProxyContext {
    pub config: Arc<ProxyConfig>,
    pub agent_id: String,
    pub sandbox: SandboxProvider,
    pub runs: RunManager,
    /// Arrival order of `acp_open` and `prompt_send` per run id.
    pub lanes: RunLanes,
    pub http: reqwest::Client,
    /// Values redacted from everything forwarded or logged.
    pub secrets: SecretSet,
    pub inputs_cache_dir: PathBuf,
    outbox: Outbox,
    link_generation: AtomicU64,
    next_control_id: AtomicU64,
    controls: StdMutex<HashMap<u64, PendingControl>>,
}

impl std::fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyContext")
            .field("agent_id", &self.agent_id)
            .field("provider", &self.sandbox.name())
            .finish()
    }
}

impl ProxyContext {
    pub fn new(config: ProxyConfig, agent_id: String, outbox: Outbox) -> Result<Arc<Self>, RuntimeError> {
        let sandbox = SandboxProvider::from_config(&config.sandbox)?;
        Self::with_sandbox(config, agent_id, sandbox, outbox)
    }

    pub fn with_sandbox(
        config: ProxyConfig,
        agent_id: String,
        sandbox: SandboxProvider,
        outbox: Outbox,
    ) -> Result<Arc<Self>, RuntimeError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("run-proxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| RuntimeError::stream(format!("failed to build http client: {err}")))?;

        let mut secrets = SecretSet::new();
        if let Some(token) = config.auth_token() {
            secrets.add(token);
        }
        secrets.add_env(&config.sandbox.env);

        Ok(Arc::new(Self {
            config: Arc::new(config),
            agent_id,
            sandbox,
            runs: RunManager::new(),
            lanes: RunLanes::new(),
            http,
            secrets,
            inputs_cache_dir: default_cache_dir(),
            outbox,
            link_generation: AtomicU64::new(0),
            next_control_id: AtomicU64::new(1),
            controls: StdMutex::new(HashMap::new()),
        }))
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    pub fn send(&self, message: Value) {
        self.outbox.send(message);
    }

    pub fn send_update(&self, run_id: &str, content: Value) {
        self.send(json!({ "type": "proxy_update", "run_id": run_id, "content": content }));
    }

    pub fn send_text(&self, run_id: &str, text: &str) {
        self.send_update(run_id, json!({ "type": "text", "text": text }));
    }

    pub fn send_acp_update(&self, run_id: &str, prompt_id: Option<&str>, session_id: Option<&str>, update: Value) {
        self.send(json!({
            "type": "acp_update",
            "run_id": run_id,
            "prompt_id": prompt_id,
            "session_id": session_id,
            "update": update,
        }));
    }

    pub fn send_instance_status(
        &self,
        run_id: &str,
        instance_name: &str,
        status: InstanceStatus,
        last_error: Option<&str>,
    ) {
        self.send_update(
            run_id,
            json!({
                "type": "sandbox_instance_status",
                "instance_name": instance_name,
                "provider": self.sandbox.name(),
                "runtime": self.sandbox.runtime(),
                "status": status,
                "last_seen_at": now_rfc3339(),
                "last_error": last_error,
            }),
        );
    }

    /// Inspects the instance and reports whatever it finds; an inspect
    /// failure is reported as `error`.
    pub async fn report_instance_status(&self, run_id: &str, instance_name: &str) {
        match self.sandbox.inspect_instance(instance_name).await {
            Ok(info) => self.send_instance_status(run_id, instance_name, info.status, None),
            Err(err) => {
                let message = self.secrets.redact(&err.to_string());
                tracing::warn!(run_id = %run_id, instance_name = %instance_name, error = %message, "inspect failed");
                self.send_instance_status(run_id, instance_name, InstanceStatus::Error, Some(&message));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Link connection bookkeeping
    // -----------------------------------------------------------------------

    pub fn link_generation(&self) -> u64 {
        self.link_generation.load(Ordering::SeqCst)
    }

    pub(crate) fn set_link_generation(&self, generation: u64) {
        self.link_generation.store(generation, Ordering::SeqCst);
    }

    fn controls(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingControl>> {
        self.controls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a sandbox-control request tied to the current connection and
    /// sends the reply `task` produces. If that connection drops first, the
    /// task is aborted and `reply` goes out with `ok:false` instead. Exactly
    /// one of the two is sent: whoever removes the entry replies.
    pub(crate) fn spawn_control<F>(self: &Arc<Self>, reply: Value, task: F)
    where
        F: std::future::Future<Output = Value> + Send + 'static,
    {
        let id = self.next_control_id.fetch_add(1, Ordering::SeqCst);
        let generation = self.link_generation();
        let ctx = self.clone();
        // Registration happens under the lock so the task cannot finish
        // before it is known.
        let mut controls = self.controls();
        let handle = tokio::spawn(async move {
            let reply = task.await;
            let owned = ctx.controls().remove(&id).is_some();
            if owned {
                ctx.send(reply);
            } else {
                tracing::debug!(control = id, "sandbox control finished after its connection was failed");
            }
        });
        controls.insert(
            id,
            PendingControl {
                generation,
                abort: handle.abort_handle(),
                reply,
            },
        );
    }

    pub fn pending_controls(&self) -> usize {
        self.controls().len()
    }

    pub(crate) fn fail_controls(&self, generation: u64) {
        let failed: Vec<PendingControl> = {
            let mut controls = self.controls();
            let ids: Vec<u64> = controls
                .iter()
                .filter(|(_, control)| control.generation == generation)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| controls.remove(&id)).collect()
        };
        if !failed.is_empty() {
            tracing::warn!(generation, pending_count = failed.len(), "failing sandbox controls of lost connection");
        }
        for control in failed {
            control.abort.abort();
            let mut reply = control.reply;
            reply["ok"] = json!(false);
            reply["error"] = json!("connection lost");
            self.send(reply);
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Routes one inbound command. Run work is spawned so the link never
    /// waits on it.
    pub fn dispatch(self: &Arc<Self>, message: Value) {
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        tracing::debug!(message_type = %kind, "inbound command");
        let ctx = self.clone();
        // Slots are taken here, before any await, so per-run order is the
        // order the link delivered.
        let run_id = non_empty_str(message.get("run_id"));
        match kind.as_str() {
            "acp_open" => {
                let slot = run_id.map(|run_id| self.lanes.reserve(run_id));
                tokio::spawn(handlers::acp_open(ctx, message, slot));
            }
            "acp_close" => {
                if let Some(run_id) = run_id {
                    self.lanes.close(run_id);
                }
                tokio::spawn(handlers::acp_close(ctx, message));
            }
            "prompt_send" => {
                let slot = run_id.map(|run_id| self.lanes.reserve(run_id));
                tokio::spawn(handlers::prompt_send(ctx, message, slot));
            }
            "session_cancel" | "session_set_mode" | "session_set_model" => {
                if let Some(control) = handlers::SessionControl::from_type(&kind) {
                    tokio::spawn(handlers::session_control(ctx, control, message));
                }
            }
            "session_permission" => {
                tokio::spawn(handlers::session_permission(ctx, message));
            }
            "sandbox_control" => sandbox_control::dispatch(&ctx, message),
            other => tracing::debug!(message_type = %other, "ignoring unknown command"),
        }
    }
}
