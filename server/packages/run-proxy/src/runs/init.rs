use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use acp_stdio_bridge::BoxedReader;
use run_proxy_agent_inputs::{parse_agent_inputs_from_init, AgentInputsManifest};
use run_proxy_error::RuntimeError;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::config::ProxyConfig;
use crate::proxy::ProxyContext;
use crate::sandbox::shell::is_env_name;
use crate::sandbox::{ExecOpts, InitSpec, WORKSPACE_GUEST_ROOT};
use crate::secrets::SecretSet;
use crate::validate::{init_timeout, DEFAULT_INIT_TIMEOUT_SECONDS};

use super::Run;

pub const INIT_STEP_PREFIX: &str = "__RUN_PROXY_INIT_STEP__:";

/// Keys the runtime itself sets; they always reach the agent.
const RUNTIME_ENV_KEYS: [&str; 5] = ["HOME", "USER_HOME", "USER", "LOGNAME", "CODEX_HOME"];

/// The `init` object of `acp_open` / `prompt_send`.
#[derive(Debug, Clone)]
pub struct RunInit {
    pub script: Option<String>,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
    pub agent_inputs: Option<AgentInputsManifest>,
}

impl Default for RunInit {
    fn default() -> Self {
        Self {
            script: None,
            timeout: Duration::from_secs(DEFAULT_INIT_TIMEOUT_SECONDS),
            env: BTreeMap::new(),
            agent_inputs: None,
        }
    }
}

impl RunInit {
    pub fn from_value(raw: Option<&Value>) -> Result<Self, RuntimeError> {
        let Some(raw) = raw.filter(|raw| !raw.is_null()) else {
            return Ok(Self::default());
        };
        let Some(object) = raw.as_object() else {
            return Err(RuntimeError::invalid("init must be an object"));
        };

        let script = object
            .get("script")
            .and_then(Value::as_str)
            .filter(|script| !script.trim().is_empty())
            .map(str::to_string);

        let mut env = BTreeMap::new();
        match object.get("env") {
            None | Some(Value::Null) => {}
            Some(Value::Object(entries)) => {
                for (key, value) in entries {
                    if !is_env_name(key) {
                        return Err(RuntimeError::invalid(format!("init.env has invalid key: {key}")));
                    }
                    let value = match value {
                        Value::Null => continue,
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    env.insert(key.clone(), value);
                }
            }
            Some(_) => return Err(RuntimeError::invalid("init.env must be an object")),
        }

        Ok(Self {
            script,
            timeout: init_timeout(object.get("timeout_seconds")),
            env,
            agent_inputs: parse_agent_inputs_from_init(raw)?,
        })
    }

    /// Entrypoint-mode payload for the sandbox, when there is a script.
    pub fn init_spec(&self, env: &BTreeMap<String, String>) -> Option<InitSpec> {
        self.script.as_ref().map(|script| InitSpec {
            script: script.clone(),
            env: env.clone(),
        })
    }
}

/// Keeps the configured allowlist plus the keys the runtime manages.
pub fn allowed_env(config: &ProxyConfig, run_id: &str, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let allow: BTreeSet<&str> = config
        .agent_env_allowlist
        .iter()
        .map(|key| key.trim())
        .filter(|key| !key.is_empty())
        .chain(RUNTIME_ENV_KEYS)
        .collect();
    let out: BTreeMap<String, String> = env
        .iter()
        .filter(|(key, _)| allow.contains(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    tracing::debug!(run_id = %run_id, keys = ?out.keys().collect::<Vec<_>>(), "agent env allowlist applied");
    out
}

// ---------------------------------------------------------------------------
// Init steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitStep {
    pub stage: String,
    pub status: String,
    pub message: Option<String>,
}

impl InitStep {
    pub fn new(stage: &str, status: &str, message: Option<&str>) -> Self {
        Self {
            stage: stage.to_string(),
            status: status.to_string(),
            message: message.map(str::to_string),
        }
    }

    pub fn to_content(&self) -> Value {
        json!({
            "type": "init_step",
            "stage": self.stage,
            "status": self.status,
            "message": self.message,
        })
    }
}

/// `__RUN_PROXY_INIT_STEP__:stage:status:message`; status defaults to
/// `progress` and the message may contain further colons.
pub fn parse_init_step_line(line: &str) -> Option<InitStep> {
    let body = line.trim().strip_prefix(INIT_STEP_PREFIX)?;
    let mut parts = body.splitn(3, ':');
    let stage = parts.next().map(str::trim).filter(|stage| !stage.is_empty())?;
    let status = parts
        .next()
        .map(str::trim)
        .filter(|status| !status.is_empty())
        .unwrap_or("progress");
    let message = parts.next().map(str::trim).filter(|message| !message.is_empty());
    Some(InitStep::new(stage, status, message))
}

pub fn init_result_content(ok: bool, exit_code: Option<i32>, error: Option<&str>) -> Value {
    let mut content = json!({ "type": "init_result", "ok": ok });
    if let Some(code) = exit_code {
        content["exitCode"] = json!(code);
    }
    if let Some(error) = error {
        content["error"] = json!(error);
    }
    content
}

// ---------------------------------------------------------------------------
// Exec-mode init script
// ---------------------------------------------------------------------------

/// Runs the init script inside the instance before the agent starts.
/// Host agents never run it.
pub async fn run_init_script(
    ctx: &Arc<ProxyContext>,
    run: &Run,
    init: &RunInit,
    env: &BTreeMap<String, String>,
    secrets: &SecretSet,
) -> Result<(), RuntimeError> {
    if ctx.sandbox.is_host_process() {
        return Ok(());
    }
    let Some(script) = init.script.as_deref() else {
        return Ok(());
    };

    let timeout_secs = init.timeout.as_secs();
    ctx.send_text(&run.run_id, &format!("[init] start (bash, timeout={timeout_secs}s)"));
    tracing::info!(run_id = %run.run_id, timeout_secs, "init script start");

    let mut handle = ctx
        .sandbox
        .exec_process(&ExecOpts {
            instance_name: run.instance_name.clone(),
            command: vec!["bash".to_string(), "-lc".to_string(), script.to_string()],
            cwd_in_guest: WORKSPACE_GUEST_ROOT.to_string(),
            env: allowed_env(&ctx.config, &run.run_id, env),
        })
        .await?;

    let stdout = handle
        .take_stdout()
        .unwrap_or_else(|| Box::pin(tokio::io::empty()) as BoxedReader);
    let stderr = handle
        .take_stderr()
        .unwrap_or_else(|| Box::pin(tokio::io::empty()) as BoxedReader);
    let forward = tokio::spawn(forward_init_output(
        ctx.clone(),
        run.run_id.clone(),
        stdout,
        stderr,
        secrets.clone(),
    ));

    let waited = tokio::time::timeout(init.timeout, handle.wait()).await;
    let info = match waited {
        Ok(info) => info,
        Err(_) => {
            handle.close();
            forward.abort();
            let error = format!("timeout after {timeout_secs}s");
            tracing::warn!(run_id = %run.run_id, "init script timed out");
            ctx.send_update(&run.run_id, init_result_content(false, None, Some(&error)));
            return Err(RuntimeError::InitFailed { detail: Some(error) });
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(2), forward).await;

    if !info.success() {
        let error = match info.code {
            Some(code) => format!("exitCode={code}"),
            None => format!("signal={}", info.signal.unwrap_or_default()),
        };
        tracing::warn!(run_id = %run.run_id, code = ?info.code, signal = ?info.signal, "init script failed");
        ctx.send_update(&run.run_id, init_result_content(false, info.code, Some(&error)));
        return Err(RuntimeError::InitFailed { detail: Some(error) });
    }

    tracing::info!(run_id = %run.run_id, "init script done");
    ctx.send_update(&run.run_id, init_result_content(true, Some(0), None));
    ctx.send_text(&run.run_id, "[init] done");
    Ok(())
}

async fn forward_init_output(
    ctx: Arc<ProxyContext>,
    run_id: String,
    stdout: BoxedReader,
    stderr: BoxedReader,
    secrets: SecretSet,
) {
    let stdout = LinesStream::new(BufReader::new(stdout).lines()).map(|line| ("stdout", line));
    let stderr = LinesStream::new(BufReader::new(stderr).lines()).map(|line| ("stderr", line));
    let mut lines = stdout.merge(stderr);
    while let Some((stream, line)) = lines.next().await {
        let Ok(line) = line else {
            continue;
        };
        if line.trim().is_empty() {
            continue;
        }
        let line = secrets.redact(&line);
        match parse_init_step_line(&line) {
            Some(step) => ctx.send_update(&run_id, step.to_content()),
            None => ctx.send_text(&run_id, &format!("[init:{stream}] {line}")),
        }
    }
}
