use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use run_proxy_agent_inputs::{apply_agent_inputs, ApplyContext, ZipLimits};
use run_proxy_error::RuntimeError;
use serde_json::Value;

use crate::proxy::ProxyContext;
use crate::sandbox::{normalize_guest_cwd, AgentMode, EnsureRunningOpts, InstanceStatus, WORKSPACE_GUEST_ROOT};
use crate::validate::{
    default_instance_name, keepalive_ttl_seconds, non_empty_str, validate_instance_name, validate_run_id,
};

use super::agent::{ensure_initialized, AgentLaunch};
use super::init::{run_init_script, RunInit};
use super::workspace::{prepare_git_workspace, resolve_run_paths, GitAuth, GitWorkspaceSpec};
use super::Run;

/// The Run-addressing part shared by `acp_open` and `prompt_send`.
#[derive(Debug, Clone)]
pub struct RuntimeRequest {
    pub run_id: String,
    /// `None` keeps the instance an existing Run is bound to.
    pub instance_name: Option<String>,
    pub keepalive_ttl: Duration,
    pub init: RunInit,
    pub cwd: Option<String>,
}

impl RuntimeRequest {
    pub fn from_message(msg: &Value) -> Result<Self, RuntimeError> {
        let run_id = validate_run_id(msg.get("run_id"))?;
        let instance_name = non_empty_str(msg.get("instance_name"))
            .map(validate_instance_name)
            .transpose()?;
        let cwd = non_empty_str(msg.get("cwd"))
            .map(|cwd| normalize_guest_cwd(cwd).map_err(RuntimeError::from))
            .transpose()?;
        Ok(Self {
            run_id,
            instance_name,
            keepalive_ttl: Duration::from_secs(keepalive_ttl_seconds(msg.get("keepalive_ttl_seconds"))),
            init: RunInit::from_value(msg.get("init"))?,
            cwd,
        })
    }
}

/// Finds or creates the Run, resolves its host directories and makes sure
/// its sandbox instance is up. Entrypoint providers only report the current
/// instance state; the instance is created together with the agent.
pub async fn ensure_runtime(ctx: &Arc<ProxyContext>, req: &RuntimeRequest) -> Result<Arc<Run>, RuntimeError> {
    let instance_name = match &req.instance_name {
        Some(name) => name.clone(),
        None => match ctx.runs.get(&req.run_id).await {
            Some(run) => run.instance_name.clone(),
            None => validate_instance_name(&default_instance_name(&req.run_id))?,
        },
    };
    let run = ctx
        .runs
        .get_or_create(&req.run_id, &instance_name, req.keepalive_ttl)
        .await?;

    let workspace = resolve_run_paths(
        &ctx.config.sandbox.workspace_host_root,
        &run.run_id,
        req.init.agent_inputs.as_ref(),
        &req.init.env,
    )?;
    workspace.create_dirs().await?;
    let mounts = workspace.mounts.clone();
    {
        let mut state = run.state();
        state.workspace = Some(workspace);
        if let Some(cwd) = &req.cwd {
            state.default_cwd = Some(cwd.clone());
        }
    }

    if ctx.sandbox.agent_mode() == AgentMode::Entrypoint {
        ctx.report_instance_status(&run.run_id, &run.instance_name).await;
        return Ok(run);
    }

    let info = ctx
        .sandbox
        .ensure_instance_running(&EnsureRunningOpts {
            run_id: run.run_id.clone(),
            instance_name: run.instance_name.clone(),
            workspace_guest_path: WORKSPACE_GUEST_ROOT.to_string(),
            env: BTreeMap::new(),
            mounts,
        })
        .await;
    let info = match info {
        Ok(info) => info,
        Err(err) => {
            let err = RuntimeError::from(err);
            ctx.send_instance_status(
                &run.run_id,
                &run.instance_name,
                InstanceStatus::Error,
                Some(&err.to_string()),
            );
            return Err(err);
        }
    };
    ctx.send_instance_status(&run.run_id, &run.instance_name, info.status, None);
    if info.status != InstanceStatus::Running {
        return Err(RuntimeError::SandboxCommandFailed {
            command: format!("{} ensure_running", ctx.sandbox.name()),
            message: format!("sandbox instance is not running: {}", info.status.as_str()),
        });
    }
    Ok(run)
}

/// Agent env before the allowlist: the guest home fills `USER_HOME` and
/// `HOME` when missing, then the manifest's env patch applies.
pub fn open_env(run: &Run, init: &RunInit) -> BTreeMap<String, String> {
    let mut env = init.env.clone();
    if let Some(workspace) = run.workspace() {
        for key in ["USER_HOME", "HOME"] {
            let missing = env.get(key).map_or(true, |value| value.trim().is_empty());
            if missing {
                env.insert(key.to_string(), workspace.guest_home.clone());
            }
        }
    }
    if let Some(manifest) = &init.agent_inputs {
        env.extend(manifest.env_patch.clone());
    }
    env
}

/// Brings the Run to `ready`: git workspace, agent inputs, exec-mode init
/// script, then agent spawn and `initialize`. A ready Run is left alone and
/// a spawned but uninitialized agent only gets its handshake.
pub async fn ensure_run_open(ctx: &Arc<ProxyContext>, run: &Arc<Run>, init: &RunInit) -> Result<(), RuntimeError> {
    if run.is_initialized() {
        return Ok(());
    }
    if run.bridge().is_some() {
        ensure_initialized(ctx, run, None).await?;
        return Ok(());
    }

    let workspace = run
        .workspace()
        .ok_or_else(|| RuntimeError::invalid("run workspace has not been resolved"))?;
    let env = open_env(run, init);
    let mut secrets = ctx.secrets.clone();
    secrets.add_env(&env);

    if let Some(spec) = GitWorkspaceSpec::from_env(&env)? {
        if let GitAuth::HttpPassword { password, .. } = &spec.auth {
            secrets.add(password);
        }
        prepare_git_workspace(ctx, &run.run_id, &workspace, &spec, &secrets).await?;
    }

    if let Some(manifest) = &init.agent_inputs {
        let apply = ApplyContext {
            run_id: run.run_id.clone(),
            workspace_host: Some(workspace.host_workspace.clone()),
            home_host: Some(workspace.host_home.clone()),
            orchestrator_url: ctx.config.orchestrator_url.clone(),
            auth_token: ctx.config.auth_token().map(str::to_string),
            cache_dir: ctx.inputs_cache_dir.clone(),
            max_download_bytes: ctx.config.inputs_download_max_bytes,
            zip_limits: ZipLimits::default(),
            client: ctx.http.clone(),
        };
        let report = apply_agent_inputs(&apply, manifest).await?;
        tracing::info!(
            run_id = %run.run_id,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "agent inputs applied"
        );
    }

    if ctx.sandbox.agent_mode() == AgentMode::Exec {
        run_init_script(ctx, run, init, &env, &secrets).await?;
    }

    ensure_initialized(
        ctx,
        run,
        Some(AgentLaunch {
            init,
            env: &env,
            secrets: &secrets,
        }),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn runtime_request_validates_addressing() {
        let req = RuntimeRequest::from_message(&json!({
            "run_id": "r1",
            "keepalive_ttl_seconds": 5,
            "cwd": "sub/dir",
            "init": { "script": "true" }
        }))
        .expect("request");
        assert_eq!(req.run_id, "r1");
        assert_eq!(req.instance_name, None);
        assert_eq!(req.keepalive_ttl, Duration::from_secs(60));
        assert_eq!(req.cwd.as_deref(), Some("/workspace/sub/dir"));
        assert_eq!(req.init.script.as_deref(), Some("true"));

        assert!(RuntimeRequest::from_message(&json!({ "run_id": "a/b" })).is_err());
        assert!(RuntimeRequest::from_message(&json!({ "run_id": "r1", "instance_name": "-bad" })).is_err());
        assert!(RuntimeRequest::from_message(&json!({ "run_id": "r1", "cwd": "/etc" })).is_err());
    }
}
