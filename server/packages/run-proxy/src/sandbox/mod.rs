//! Sandbox providers: one closed set of isolation strategies behind a single
//! lifecycle and exec surface.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use acp_stdio_bridge::{ProcessError, ProcessHandle};
use run_proxy_agent_inputs::is_descendant;
use run_proxy_error::RuntimeError;
use serde::Serialize;
use thiserror::Error;

use crate::config::{ProviderKind, SandboxConfig};

pub mod bwrap;
pub mod command;
pub mod container;
pub mod host_process;
pub mod micro_vm;
pub mod registry;
pub mod shell;

pub use bwrap::BwrapSandbox;
pub use container::{ContainerCli, ContainerSandbox};
pub use host_process::HostProcessSandbox;
pub use micro_vm::{BoxliteCli, MicroVmBackend, MicroVmSandbox};

pub const WORKSPACE_GUEST_ROOT: &str = "/workspace";

pub const LABEL_MANAGED: &str = "run-proxy.managed";
pub const LABEL_RUN_ID: &str = "run-proxy.run_id";
pub const LABEL_AGENT_MODE: &str = "run-proxy.agent_mode";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{0}")]
    PlatformUnsupported(String),
    #[error("sandbox.workspaceHostRoot missing")]
    WorkspaceRootMissing,
    #[error("workspaceHostPath missing")]
    WorkspacePathMissing,
    #[error("workspaceHostPath outside workspaceHostRoot")]
    WorkspaceOutsideRoot,
    #[error("cwd is empty")]
    CwdEmpty,
    #[error("cwd outside workspace")]
    CwdOutsideWorkspace,
    #[error("{what} {reason}: {path}")]
    InvalidGuestPath {
        what: &'static str,
        reason: &'static str,
        path: String,
    },
    #[error("instance missing: {instance_name}")]
    InstanceMissing { instance_name: String },
    #[error("command is empty")]
    EmptyCommand,
    #[error("{provider} does not support {action}")]
    Unsupported {
        provider: &'static str,
        action: &'static str,
    },
    #[error("existing instance {instance_name} is not in entrypoint mode ({label}={value:?}); remove it and retry")]
    AgentModeMismatch {
        instance_name: String,
        label: &'static str,
        value: String,
    },
    #[error("unsupported container runtime: {0} (expected docker, podman or nerdctl)")]
    UnknownContainerCli(String),
    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error("`{command}` timed out after {timeout_ms}ms")]
    CommandTimeout { command: String, timeout_ms: u64 },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry error: {0}")]
    Registry(String),
}

impl From<SandboxError> for RuntimeError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::PlatformUnsupported(message) => RuntimeError::PlatformUnsupported { message },
            SandboxError::CwdOutsideWorkspace
            | SandboxError::WorkspaceOutsideRoot
            | SandboxError::InvalidGuestPath { .. } => RuntimeError::PathEscape {
                path: String::new(),
                message: err.to_string(),
            },
            SandboxError::CwdEmpty | SandboxError::EmptyCommand | SandboxError::UnknownContainerCli(_) => {
                RuntimeError::invalid(err.to_string())
            }
            SandboxError::InstanceMissing { instance_name } => {
                RuntimeError::InstanceMissing { instance_name }
            }
            SandboxError::AgentModeMismatch { .. } => RuntimeError::Conflict {
                message: err.to_string(),
            },
            SandboxError::Command { command, message } => {
                RuntimeError::SandboxCommandFailed { command, message }
            }
            SandboxError::CommandTimeout { .. } => RuntimeError::Timeout {
                message: err.to_string(),
            },
            other => RuntimeError::SandboxCommandFailed {
                command: String::new(),
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Missing,
    Creating,
    Running,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceInfo {
    pub instance_name: String,
    pub status: InstanceStatus,
    pub created_at: Option<String>,
}

impl InstanceInfo {
    pub fn missing(instance_name: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            status: InstanceStatus::Missing,
            created_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// The agent is started with a separate exec inside a running instance.
    Exec,
    /// The agent is the instance's entrypoint; init runs inside the same shell.
    Entrypoint,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Entrypoint => "entrypoint",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub guest_path: String,
    pub read_only: bool,
}

impl Mount {
    /// `host:guest[:ro]`, the `-v` syntax shared by the container CLIs.
    pub fn to_volume_arg(&self) -> String {
        let suffix = if self.read_only { ":ro" } else { "" };
        format!("{}:{}{}", self.host_path.display(), self.guest_path, suffix)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnsureRunningOpts {
    pub run_id: String,
    pub instance_name: String,
    pub workspace_guest_path: String,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub instance_name: String,
    pub command: Vec<String>,
    pub cwd_in_guest: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct InitSpec {
    pub script: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct OpenAgentOpts {
    pub run_id: String,
    pub instance_name: String,
    pub workspace_guest_path: String,
    pub mounts: Vec<Mount>,
    pub agent_command: Vec<String>,
    /// Env for the agent process itself, already filtered by the allowlist.
    pub env: BTreeMap<String, String>,
    /// Only consumed in entrypoint mode.
    pub init: Option<InitSpec>,
}

#[derive(Debug)]
pub struct OpenedAgent {
    pub handle: ProcessHandle,
    pub created: bool,
    pub init_pending: bool,
}

#[derive(Debug)]
pub enum SandboxProvider {
    HostProcess(HostProcessSandbox),
    Namespace(BwrapSandbox),
    ContainerCli(ContainerSandbox),
    MicroVm(MicroVmSandbox),
}

impl SandboxProvider {
    pub fn from_config(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let provider = match config.provider {
            ProviderKind::HostProcess => Self::HostProcess(HostProcessSandbox::new(config)),
            ProviderKind::Bwrap => Self::Namespace(BwrapSandbox::new(config)),
            ProviderKind::ContainerOci => Self::ContainerCli(ContainerSandbox::new(config)?),
            ProviderKind::Boxlite => {
                let backend = BoxliteCli::new(config);
                Self::MicroVm(MicroVmSandbox::new(config, Box::new(backend)))
            }
        };
        tracing::info!(
            provider = provider.name(),
            agent_mode = provider.agent_mode().as_str(),
            workspace_host_root = %config.workspace_host_root.display(),
            "sandbox provider ready"
        );
        Ok(provider)
    }

    /// Wire name, as reported to the orchestrator.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HostProcess(_) => "host_process",
            Self::Namespace(_) => "bwrap",
            Self::ContainerCli(_) => "container_oci",
            Self::MicroVm(_) => "boxlite",
        }
    }

    pub fn runtime(&self) -> Option<&str> {
        match self {
            Self::ContainerCli(sandbox) => Some(sandbox.cli().as_str()),
            _ => None,
        }
    }

    pub fn agent_mode(&self) -> AgentMode {
        match self {
            Self::ContainerCli(_) => AgentMode::Entrypoint,
            _ => AgentMode::Exec,
        }
    }

    pub fn is_host_process(&self) -> bool {
        matches!(self, Self::HostProcess(_))
    }

    pub async fn inspect_instance(&self, instance_name: &str) -> Result<InstanceInfo, SandboxError> {
        match self {
            Self::HostProcess(sandbox) => Ok(sandbox.inspect_instance(instance_name).await),
            Self::Namespace(sandbox) => sandbox.inspect_instance(instance_name).await,
            Self::ContainerCli(sandbox) => sandbox.inspect_instance(instance_name).await,
            Self::MicroVm(sandbox) => sandbox.inspect_instance(instance_name).await,
        }
    }

    pub async fn ensure_instance_running(&self, opts: &EnsureRunningOpts) -> Result<InstanceInfo, SandboxError> {
        match self {
            Self::HostProcess(sandbox) => sandbox.ensure_instance_running(opts).await,
            Self::Namespace(sandbox) => sandbox.ensure_instance_running(opts).await,
            Self::ContainerCli(sandbox) => sandbox.ensure_instance_running(opts).await,
            Self::MicroVm(sandbox) => sandbox.ensure_instance_running(opts).await,
        }
    }

    pub async fn exec_process(&self, opts: &ExecOpts) -> Result<ProcessHandle, SandboxError> {
        if opts.command.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }
        match self {
            Self::HostProcess(sandbox) => sandbox.exec_process(opts).await,
            Self::Namespace(sandbox) => sandbox.exec_process(opts).await,
            Self::ContainerCli(sandbox) => sandbox.exec_process(opts).await,
            Self::MicroVm(sandbox) => sandbox.exec_process(opts).await,
        }
    }

    pub async fn open_agent(&self, opts: &OpenAgentOpts) -> Result<OpenedAgent, SandboxError> {
        if opts.agent_command.is_empty() {
            return Err(SandboxError::EmptyCommand);
        }
        match self {
            Self::HostProcess(sandbox) => sandbox.open_agent(opts).await,
            Self::Namespace(sandbox) => sandbox.open_agent(opts).await,
            Self::ContainerCli(sandbox) => sandbox.open_agent(opts).await,
            Self::MicroVm(sandbox) => sandbox.open_agent(opts).await,
        }
    }

    pub async fn list_instances(&self, managed_only: bool) -> Result<Vec<InstanceInfo>, SandboxError> {
        match self {
            Self::HostProcess(sandbox) => Ok(sandbox.list_instances().await),
            Self::Namespace(sandbox) => sandbox.list_instances().await,
            Self::ContainerCli(sandbox) => sandbox.list_instances(managed_only).await,
            Self::MicroVm(sandbox) => sandbox.list_instances(managed_only).await,
        }
    }

    pub async fn stop_instance(&self, instance_name: &str) -> Result<(), SandboxError> {
        match self {
            Self::HostProcess(sandbox) => {
                sandbox.stop_instance(instance_name).await;
                Ok(())
            }
            Self::Namespace(sandbox) => sandbox.stop_instance(instance_name).await,
            Self::ContainerCli(sandbox) => sandbox.stop_instance(instance_name).await,
            Self::MicroVm(sandbox) => sandbox.stop_instance(instance_name).await,
        }
    }

    pub async fn remove_instance(&self, instance_name: &str) -> Result<(), SandboxError> {
        match self {
            Self::HostProcess(sandbox) => {
                sandbox.remove_instance(instance_name).await;
                Ok(())
            }
            Self::Namespace(sandbox) => sandbox.remove_instance(instance_name).await,
            Self::ContainerCli(sandbox) => sandbox.remove_instance(instance_name).await.map(|_| ()),
            Self::MicroVm(sandbox) => sandbox.remove_instance(instance_name).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Guest path rules
// ---------------------------------------------------------------------------

/// Lexical POSIX normalization: collapses `.`/`..`/duplicate slashes.
/// `..` never climbs above `/` for absolute paths.
pub fn posix_normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

fn is_windows_style(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with("\\\\")
        || path.contains('\\')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

/// Resolves a requested cwd to an absolute guest path under `/workspace`.
pub fn normalize_guest_cwd(requested: &str) -> Result<String, SandboxError> {
    let raw = requested.trim();
    if raw.is_empty() {
        return Err(SandboxError::CwdEmpty);
    }
    if is_windows_style(raw) {
        return Err(SandboxError::CwdOutsideWorkspace);
    }
    let candidate = if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("{WORKSPACE_GUEST_ROOT}/{raw}")
    };
    let normalized = posix_normalize(&candidate);
    if normalized == WORKSPACE_GUEST_ROOT || normalized.starts_with(&format!("{WORKSPACE_GUEST_ROOT}/")) {
        Ok(normalized)
    } else {
        Err(SandboxError::CwdOutsideWorkspace)
    }
}

/// Maps a guest cwd onto the host directory backing `/workspace`.
pub fn guest_to_host(host_workspace: &Path, guest_cwd: &str) -> Result<PathBuf, SandboxError> {
    let normalized = normalize_guest_cwd(guest_cwd)?;
    let relative = normalized
        .strip_prefix(WORKSPACE_GUEST_ROOT)
        .unwrap_or_default()
        .trim_start_matches('/');
    let host = if relative.is_empty() {
        host_workspace.to_path_buf()
    } else {
        host_workspace.join(relative)
    };
    if !is_descendant(host_workspace, &host) {
        return Err(SandboxError::CwdOutsideWorkspace);
    }
    Ok(host)
}

/// Absolute guest mount target without `..` segments.
pub fn normalize_guest_mount_path(what: &'static str, guest_path: &str) -> Result<String, SandboxError> {
    let raw = guest_path.trim();
    let invalid = |reason| SandboxError::InvalidGuestPath {
        what,
        reason,
        path: raw.to_string(),
    };
    if raw.is_empty() {
        return Err(invalid("is empty"));
    }
    if !raw.starts_with('/') {
        return Err(invalid("must be absolute"));
    }
    if raw.split('/').any(|segment| segment == "..") {
        return Err(invalid("must not include '..'"));
    }
    Ok(posix_normalize(raw))
}

pub(crate) fn absolute_root(root: &Path) -> Result<PathBuf, SandboxError> {
    if root.as_os_str().is_empty() {
        return Err(SandboxError::WorkspaceRootMissing);
    }
    if root.is_absolute() {
        return Ok(root.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(root))
}

/// Host directory that backs `/workspace` for a Run: an explicit
/// `/workspace` mount wins, then `<root>/run-<id>`, then what the instance
/// already used. The result must stay under the workspace root.
pub(crate) fn resolve_workspace_host_path(
    root: &Path,
    run_id: &str,
    mounts: &[Mount],
    existing: Option<&Path>,
) -> Result<PathBuf, SandboxError> {
    let root = absolute_root(root)?;
    let host = mounts
        .iter()
        .find(|mount| mount.guest_path == WORKSPACE_GUEST_ROOT)
        .map(|mount| mount.host_path.clone())
        .or_else(|| {
            let run_id = run_id.trim();
            (!run_id.is_empty()).then(|| root.join(format!("run-{run_id}")))
        })
        .or_else(|| existing.map(Path::to_path_buf))
        .ok_or(SandboxError::WorkspacePathMissing)?;
    if !is_descendant(&root, &host) {
        return Err(SandboxError::WorkspaceOutsideRoot);
    }
    Ok(host)
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
