//! Host-side directories backing a Run, and the optional git checkout that
//! seeds its workspace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use acp_stdio_bridge::process::format_command_for_display;
use run_proxy_agent_inputs::{is_descendant, AgentInputsManifest};
use run_proxy_error::RuntimeError;
use tokio::process::Command;
use tokio::time::Instant;

use crate::proxy::ProxyContext;
use crate::sandbox::{
    absolute_root, normalize_guest_mount_path, posix_normalize, Mount, WORKSPACE_GUEST_ROOT,
};
use crate::secrets::SecretSet;

use super::init::InitStep;

pub const DEFAULT_GUEST_HOME: &str = "/root";

/// Paths resolved once per Run by `ensure_runtime`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWorkspace {
    pub host_workspace: PathBuf,
    pub host_home: PathBuf,
    pub guest_home: String,
    pub mounts: Vec<Mount>,
}

impl RunWorkspace {
    pub async fn create_dirs(&self) -> Result<(), RuntimeError> {
        let io = |err: std::io::Error| RuntimeError::stream(format!("failed to prepare run directories: {err}"));
        tokio::fs::create_dir_all(&self.host_workspace).await.map_err(io)?;
        tokio::fs::create_dir_all(self.host_home.join(".codex").join("skills"))
            .await
            .map_err(io)?;
        Ok(())
    }
}

/// `USER_HOME`, then `HOME`, else `/root`. Never `/workspace` or below it.
pub fn resolve_guest_home(env: &BTreeMap<String, String>) -> Result<String, RuntimeError> {
    let raw = ["USER_HOME", "HOME"]
        .iter()
        .filter_map(|key| env.get(*key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
        .unwrap_or(DEFAULT_GUEST_HOME);
    let home = normalize_guest_mount_path("guest home", raw)?;
    if home == WORKSPACE_GUEST_ROOT || home.starts_with(&format!("{WORKSPACE_GUEST_ROOT}/")) {
        return Err(RuntimeError::PathEscape {
            path: home,
            message: "guest home must not be inside /workspace".to_string(),
        });
    }
    Ok(home)
}

pub fn resolve_run_paths(
    workspace_host_root: &Path,
    run_id: &str,
    manifest: Option<&AgentInputsManifest>,
    env: &BTreeMap<String, String>,
) -> Result<RunWorkspace, RuntimeError> {
    let root = absolute_root(workspace_host_root)?;

    let host_workspace = match manifest.and_then(AgentInputsManifest::workspace_root_bind) {
        Some(bind) if Path::new(bind).is_absolute() => PathBuf::from(posix_normalize(bind)),
        _ => root.join(format!("run-{run_id}")),
    };
    if !is_descendant(&root, &host_workspace) {
        return Err(RuntimeError::PathEscape {
            path: host_workspace.display().to_string(),
            message: "agentInputs WORKSPACE bindMount hostPath must be under sandbox.workspaceHostRoot"
                .to_string(),
        });
    }
    let host_home = root.join(format!("home-{run_id}"));
    let guest_home = resolve_guest_home(env)?;

    let mut mounts = vec![
        Mount {
            host_path: host_workspace.clone(),
            guest_path: WORKSPACE_GUEST_ROOT.to_string(),
            read_only: false,
        },
        Mount {
            host_path: host_home.clone(),
            guest_path: guest_home.clone(),
            read_only: false,
        },
    ];
    for extra in manifest.map(AgentInputsManifest::extra_mounts).unwrap_or_default() {
        if !Path::new(&extra.host_path).is_absolute() {
            return Err(RuntimeError::InvalidAgentInputs {
                code: "INVALID_AGENT_INPUTS_ITEM".to_string(),
                message: format!("bindMount hostPath must be absolute (item={})", extra.item_id),
            });
        }
        mounts.push(Mount {
            host_path: PathBuf::from(&extra.host_path),
            guest_path: posix_normalize(&format!("{WORKSPACE_GUEST_ROOT}/{}", extra.workspace_relative)),
            read_only: extra.read_only,
        });
    }

    Ok(RunWorkspace {
        host_workspace,
        host_home,
        guest_home,
        mounts,
    })
}

// ---------------------------------------------------------------------------
// Git workspace
// ---------------------------------------------------------------------------

pub const REPO_URL_ENV: &str = "RUN_PROXY_REPO_URL";

const GIT_TIMEOUT: Duration = Duration::from_secs(600);
const LOCK_POLL: Duration = Duration::from_millis(200);
const LOCK_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitWorkspaceMode {
    /// `git worktree add` from a shared clone under the workspace root.
    Worktree,
    Clone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitAuth {
    Ambient,
    HttpPassword { username: String, password: String },
    Ssh { command: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitWorkspaceSpec {
    pub repo_url: String,
    pub run_branch: String,
    pub base_branch: String,
    pub mode: GitWorkspaceMode,
    pub auth: GitAuth,
}

impl GitWorkspaceSpec {
    /// `None` when the env names no repository.
    pub fn from_env(env: &BTreeMap<String, String>) -> Result<Option<Self>, RuntimeError> {
        let get = |key: &str| {
            env.get(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let Some(repo_url) = get(REPO_URL_ENV) else {
            return Ok(None);
        };
        let run_branch = get("RUN_PROXY_RUN_BRANCH").ok_or_else(|| {
            RuntimeError::invalid("RUN_PROXY_RUN_BRANCH is required when RUN_PROXY_REPO_URL is set")
        })?;
        let base_branch = get("RUN_PROXY_BASE_BRANCH").unwrap_or_else(|| "main".to_string());
        let mode = match get("RUN_PROXY_GIT_WORKSPACE_MODE").as_deref() {
            None | Some("worktree") => GitWorkspaceMode::Worktree,
            Some("clone") => GitWorkspaceMode::Clone,
            Some(other) => {
                return Err(RuntimeError::invalid(format!(
                    "unsupported RUN_PROXY_GIT_WORKSPACE_MODE: {other}"
                )))
            }
        };
        let auth = match get("RUN_PROXY_GIT_AUTH_MODE").as_deref() {
            Some("ssh") => GitAuth::Ssh {
                command: get("RUN_PROXY_GIT_SSH_COMMAND").unwrap_or_else(|| "ssh".to_string()),
            },
            _ => match get("RUN_PROXY_GIT_HTTP_PASSWORD") {
                Some(password) => GitAuth::HttpPassword {
                    username: get("RUN_PROXY_GIT_HTTP_USERNAME")
                        .unwrap_or_else(|| "x-access-token".to_string()),
                    password,
                },
                None => GitAuth::Ambient,
            },
        };
        Ok(Some(Self {
            repo_url,
            run_branch,
            base_branch,
            mode,
            auth,
        }))
    }
}

/// Cache directory name for a repository: credentials dropped, everything
/// outside `[A-Za-z0-9._-]` collapsed into `-`.
pub fn repo_cache_key(repo_url: &str) -> String {
    let cleaned = match url::Url::parse(repo_url) {
        Ok(mut parsed) => {
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            format!("{}{}", parsed.host_str().unwrap_or_default(), parsed.path())
        }
        Err(_) => repo_url.rsplit('@').next().unwrap_or(repo_url).to_string(),
    };
    let mut key = String::with_capacity(cleaned.len());
    for c in cleaned.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            key.push(c);
        } else if !key.ends_with('-') {
            key.push('-');
        }
    }
    let key = key.trim_matches('-');
    let key: String = key.chars().take(120).collect();
    if key.is_empty() {
        "repo".to_string()
    } else {
        key
    }
}

struct CacheLock {
    path: PathBuf,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn acquire_lock(path: &Path) -> Result<CacheLock, RuntimeError> {
    let deadline = Instant::now() + LOCK_TIMEOUT;
    loop {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(_) => {
                return Ok(CacheLock {
                    path: path.to_path_buf(),
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if Instant::now() >= deadline {
                    return Err(RuntimeError::Timeout {
                        message: format!("timed out waiting for repo cache lock {}", path.display()),
                    });
                }
                tokio::time::sleep(LOCK_POLL).await;
            }
            Err(err) => {
                return Err(RuntimeError::stream(format!(
                    "failed to create repo cache lock {}: {err}",
                    path.display()
                )))
            }
        }
    }
}

struct Git<'a> {
    env: BTreeMap<String, String>,
    secrets: &'a SecretSet,
}

impl Git<'_> {
    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        let display = self.secrets.redact(&format_command_for_display("git", &args));
        let mut command = Command::new("git");
        command
            .args(&args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let failed = |message: String| RuntimeError::SandboxCommandFailed {
            command: display.clone(),
            message,
        };
        let output = match tokio::time::timeout(GIT_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(failed(err.to_string())),
            Err(_) => {
                return Err(RuntimeError::Timeout {
                    message: format!("`{display}` timed out after {}s", GIT_TIMEOUT.as_secs()),
                })
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(self.secrets.redact(stderr.trim())));
        }
        Ok(stdout)
    }
}

fn git_env(spec: &GitWorkspaceSpec, askpass: Option<&Path>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
    match &spec.auth {
        GitAuth::Ambient => {}
        GitAuth::HttpPassword { username, password } => {
            if let Some(askpass) = askpass {
                env.insert("GIT_ASKPASS".to_string(), askpass.display().to_string());
            }
            env.insert("RUN_PROXY_GIT_HTTP_USERNAME".to_string(), username.clone());
            env.insert("RUN_PROXY_GIT_HTTP_PASSWORD".to_string(), password.clone());
        }
        GitAuth::Ssh { command } => {
            env.insert("GIT_SSH_COMMAND".to_string(), command.clone());
        }
    }
    env
}

/// Answers git's username and password prompts from the environment so the
/// secret never lands on disk.
const ASKPASS_SCRIPT: &str = "#!/bin/sh\ncase \"$1\" in\n  *sername*) printf '%s\\n' \"$RUN_PROXY_GIT_HTTP_USERNAME\" ;;\n  *) printf '%s\\n' \"$RUN_PROXY_GIT_HTTP_PASSWORD\" ;;\nesac\n";

async fn write_askpass(dir: &Path) -> Result<PathBuf, RuntimeError> {
    let io = |err: std::io::Error| RuntimeError::stream(format!("failed to write git askpass helper: {err}"));
    tokio::fs::create_dir_all(dir).await.map_err(io)?;
    let path = dir.join("git-askpass.sh");
    tokio::fs::write(&path, ASKPASS_SCRIPT).await.map_err(io)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(io)?;
    }
    Ok(path)
}

/// Populates the Run's host workspace from `spec`. Progress is reported as
/// `init_step` updates; an already checked out workspace is left alone.
pub async fn prepare_git_workspace(
    ctx: &ProxyContext,
    run_id: &str,
    workspace: &RunWorkspace,
    spec: &GitWorkspaceSpec,
    secrets: &SecretSet,
) -> Result<(), RuntimeError> {
    let step = |stage: &str, status: &str, message: Option<&str>| {
        ctx.send_update(run_id, InitStep::new(stage, status, message).to_content());
    };
    let result = checkout(ctx, run_id, workspace, spec, secrets, &step).await;
    if let Err(err) = &result {
        let message = secrets.redact(&err.to_string());
        tracing::warn!(run_id = %run_id, error = %message, "git workspace preparation failed");
        step("init", "failed", Some(&message));
    }
    result
}

async fn checkout(
    ctx: &ProxyContext,
    run_id: &str,
    workspace: &RunWorkspace,
    spec: &GitWorkspaceSpec,
    secrets: &SecretSet,
    step: &impl Fn(&str, &str, Option<&str>),
) -> Result<(), RuntimeError> {
    let root = absolute_root(&ctx.config.sandbox.workspace_host_root)?;
    let state_dir = root.join(".run-proxy");
    let ws = workspace.host_workspace.display().to_string();

    step("auth", "start", None);
    let askpass = match spec.auth {
        GitAuth::HttpPassword { .. } => Some(write_askpass(&state_dir).await?),
        _ => None,
    };
    let git = Git {
        env: git_env(spec, askpass.as_deref()),
        secrets,
    };
    step("auth", "done", None);

    if workspace.host_workspace.join(".git").exists() {
        tracing::info!(run_id = %run_id, workspace = %ws, "git workspace already present");
        step("ready", "done", Some("existing checkout"));
        return Ok(());
    }

    let origin_base = format!("origin/{}", spec.base_branch);
    match spec.mode {
        GitWorkspaceMode::Clone => {
            step("clone", "start", Some(&spec.base_branch));
            git.run(&["clone", "--branch", &spec.base_branch, &spec.repo_url, &ws]).await?;
            step("clone", "done", None);
            step("checkout", "start", Some(&spec.run_branch));
            git.run(&["-C", &ws, "checkout", "-B", &spec.run_branch, &origin_base]).await?;
        }
        GitWorkspaceMode::Worktree => {
            let cache_root = state_dir.join("repo-cache");
            tokio::fs::create_dir_all(&cache_root)
                .await
                .map_err(|err| RuntimeError::stream(format!("failed to create repo cache: {err}")))?;
            let cache = cache_root.join(repo_cache_key(&spec.repo_url));
            let cache_str = cache.display().to_string();
            let _lock = acquire_lock(&cache_root.join(format!("{}.lock", repo_cache_key(&spec.repo_url)))).await?;

            step("clone", "start", Some(&spec.base_branch));
            if cache.join(".git").exists() {
                git.run(&["-C", &cache_str, "fetch", "--prune", "origin"]).await?;
            } else {
                git.run(&["clone", "--no-checkout", &spec.repo_url, &cache_str]).await?;
            }
            step("clone", "done", None);

            step("checkout", "start", Some(&spec.run_branch));
            git.run(&["-C", &cache_str, "worktree", "prune"]).await?;
            git.run(&[
                "-C",
                &cache_str,
                "worktree",
                "add",
                "-B",
                &spec.run_branch,
                &ws,
                &origin_base,
            ])
            .await?;
        }
    }
    step("checkout", "done", None);
    step("ready", "done", None);
    tracing::info!(run_id = %run_id, workspace = %ws, branch = %spec.run_branch, "git workspace ready");
    Ok(())
}
