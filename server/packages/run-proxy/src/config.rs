//! Proxy configuration: a TOML or JSON file, an optional named profile layered
//! on top, then `RUN_PROXY_*` environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::sandbox::{ContainerCli, Mount};

pub const DEFAULT_HEARTBEAT_SECONDS: u64 = 30;
pub const DEFAULT_INPUTS_DOWNLOAD_MAX_BYTES: u64 = 200 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("config profile not found: {0}")]
    ProfileNotFound(String),
    #[error("unknown sandbox provider: {0} (expected host_process, bwrap, container_oci or boxlite)")]
    UnknownProvider(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    HostProcess,
    Bwrap,
    ContainerOci,
    Boxlite,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostProcess => "host_process",
            Self::Bwrap => "bwrap",
            Self::ContainerOci => "container_oci",
            Self::Boxlite => "boxlite",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "host_process" => Ok(Self::HostProcess),
            "bwrap" => Ok(Self::Bwrap),
            "container_oci" => Ok(Self::ContainerOci),
            "boxlite" | "boxlite_oci" => Ok(Self::Boxlite),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(alias = "hostPath", alias = "source")]
    pub host_path: String,
    #[serde(alias = "guestPath", alias = "target")]
    pub guest_path: String,
    #[serde(default, alias = "readOnly")]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BwrapConfig {
    #[serde(default = "default_bwrap_bin")]
    pub bin: String,
    /// Run as a synthetic unprivileged user with generated passwd/group files.
    #[serde(default = "default_true", alias = "userView")]
    pub user_view: bool,
}

impl Default for BwrapConfig {
    fn default() -> Self {
        Self {
            bin: default_bwrap_bin(),
            user_view: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxliteConfig {
    #[serde(default = "default_boxlite_cli")]
    pub cli: String,
}

impl Default for BoxliteConfig {
    fn default() -> Self {
        Self {
            cli: default_boxlite_cli(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub provider: ProviderKind,
    #[serde(default, alias = "workspaceHostRoot")]
    pub workspace_host_root: PathBuf,
    #[serde(default, alias = "terminalEnabled")]
    pub terminal_enabled: bool,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, alias = "workingDir")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default, alias = "memoryMib")]
    pub memory_mib: Option<u64>,
    #[serde(default, alias = "extraRunArgs")]
    pub extra_run_args: Vec<String>,
    #[serde(default)]
    pub bwrap: BwrapConfig,
    #[serde(default)]
    pub boxlite: BoxliteConfig,
}

impl SandboxConfig {
    pub fn for_provider(provider: ProviderKind, workspace_host_root: PathBuf) -> Self {
        Self {
            provider,
            workspace_host_root,
            terminal_enabled: false,
            image: None,
            working_dir: None,
            runtime: None,
            volumes: Vec::new(),
            env: BTreeMap::new(),
            cpus: None,
            memory_mib: None,
            extra_run_args: Vec::new(),
            bwrap: BwrapConfig::default(),
            boxlite: BoxliteConfig::default(),
        }
    }

    pub fn volume_mounts(&self) -> Vec<Mount> {
        self.volumes
            .iter()
            .map(|volume| Mount {
                host_path: PathBuf::from(volume.host_path.trim()),
                guest_path: volume.guest_path.trim().to_string(),
                read_only: volume.read_only,
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workspace_host_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "sandbox.workspace_host_root is required".to_string(),
            ));
        }
        let has_image = self.image.as_deref().is_some_and(|image| !image.trim().is_empty());
        match self.provider {
            ProviderKind::ContainerOci => {
                if !has_image {
                    return Err(ConfigError::Invalid(
                        "sandbox.image is required for container_oci".to_string(),
                    ));
                }
                let runtime = self
                    .runtime
                    .as_deref()
                    .map(str::trim)
                    .filter(|runtime| !runtime.is_empty())
                    .ok_or_else(|| {
                        ConfigError::Invalid("sandbox.runtime is required for container_oci".to_string())
                    })?;
                runtime
                    .parse::<ContainerCli>()
                    .map_err(|err| ConfigError::Invalid(err.to_string()))?;
            }
            ProviderKind::Boxlite if !has_image => {
                return Err(ConfigError::Invalid(
                    "sandbox.image is required for boxlite".to_string(),
                ));
            }
            _ => {}
        }
        for volume in &self.volumes {
            if volume.host_path.trim().is_empty() || volume.guest_path.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "sandbox.volumes entries need host_path and guest_path".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default)]
    pub capabilities: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub orchestrator_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    #[serde(default = "default_agent_command")]
    pub agent_command: Vec<String>,
    #[serde(default)]
    pub agent_env_allowlist: Vec<String>,
    #[serde(default = "default_inputs_download_max_bytes")]
    pub inputs_download_max_bytes: u64,
    #[serde(default)]
    pub agent: AgentConfig,
    pub sandbox: SandboxConfig,
}

impl ProxyConfig {
    /// Token with surrounding whitespace removed; empty means none.
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator_url.trim().is_empty() {
            return Err(ConfigError::Invalid("orchestrator_url is required".to_string()));
        }
        url::Url::parse(self.orchestrator_url.trim())
            .map_err(|err| ConfigError::Invalid(format!("orchestrator_url: {err}")))?;
        if self.heartbeat_seconds == 0 {
            return Err(ConfigError::Invalid("heartbeat_seconds must be positive".to_string()));
        }
        if self.agent_command.iter().all(|part| part.trim().is_empty()) {
            return Err(ConfigError::Invalid("agent_command must not be empty".to_string()));
        }
        if self.agent.max_concurrent == 0 {
            return Err(ConfigError::Invalid("agent.max_concurrent must be positive".to_string()));
        }
        self.sandbox.validate()
    }
}

fn default_true() -> bool {
    true
}

fn default_bwrap_bin() -> String {
    "bwrap".to_string()
}

fn default_boxlite_cli() -> String {
    "boxlite".to_string()
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_heartbeat_seconds() -> u64 {
    DEFAULT_HEARTBEAT_SECONDS
}

fn default_inputs_download_max_bytes() -> u64 {
    DEFAULT_INPUTS_DOWNLOAD_MAX_BYTES
}

fn default_agent_command() -> Vec<String> {
    ["npx", "--yes", "@zed-industries/codex-acp"]
        .iter()
        .map(|part| part.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_config(path: &Path, profile: Option<&str>) -> Result<ProxyConfig, ConfigError> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?
            .join(path)
    };
    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let raw = parse_document(&text, is_toml).map_err(|message| ConfigError::Parse {
        path: path.display().to_string(),
        message,
    })?;
    let config = resolve_config(raw, profile, |key| std::env::var(key).ok())?;
    tracing::debug!(
        path = %path.display(),
        profile = profile.unwrap_or(""),
        provider = config.sandbox.provider.as_str(),
        "config loaded"
    );
    Ok(config)
}

pub fn parse_document(text: &str, is_toml: bool) -> Result<Value, String> {
    if is_toml {
        toml_edit::de::from_str::<Value>(text).map_err(|err| err.to_string())
    } else {
        serde_json::from_str::<Value>(text).map_err(|err| err.to_string())
    }
}

/// Applies the profile and env overrides to a parsed document, then
/// deserializes and validates it. `env` is injected so tests stay hermetic.
pub fn resolve_config(
    mut raw: Value,
    profile: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ProxyConfig, ConfigError> {
    let Some(root) = raw.as_object_mut() else {
        return Err(ConfigError::Invalid("config root must be a table".to_string()));
    };
    let profiles = root.remove("profiles");

    if let Some(name) = profile.map(str::trim).filter(|name| !name.is_empty()) {
        let overlay = profiles
            .as_ref()
            .and_then(|profiles| profiles.get(name))
            .cloned()
            .ok_or_else(|| ConfigError::ProfileNotFound(name.to_string()))?;
        merge_values(&mut raw, overlay);
    }

    apply_env_overrides(&mut raw, env)?;

    let mut config: ProxyConfig =
        serde_json::from_value(raw).map_err(|err| ConfigError::Invalid(err.to_string()))?;
    config.orchestrator_url = config.orchestrator_url.trim().to_string();
    config.agent.name = config
        .agent
        .name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    config.validate()?;
    Ok(config)
}

/// Deep merge: tables merge key by key, everything else is replaced.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_values(existing, value)
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(raw: &mut Value, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
    let read = |key: &str| {
        env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let mut top = Map::new();
    if let Some(url) = read("RUN_PROXY_ORCHESTRATOR_URL") {
        top.insert("orchestrator_url".to_string(), Value::from(url));
    }
    if let Some(token) = read("RUN_PROXY_AUTH_TOKEN") {
        top.insert("auth_token".to_string(), Value::from(token));
    }

    let mut sandbox = Map::new();
    if let Some(provider) = read("RUN_PROXY_SANDBOX_PROVIDER") {
        let provider: ProviderKind = provider.parse()?;
        sandbox.insert("provider".to_string(), Value::from(provider.as_str()));
    }
    if let Some(image) = read("RUN_PROXY_SANDBOX_IMAGE") {
        sandbox.insert("image".to_string(), Value::from(image));
    }
    if let Some(runtime) = read("RUN_PROXY_CONTAINER_RUNTIME") {
        sandbox.insert("runtime".to_string(), Value::from(runtime));
    }
    if let Some(root) = read("RUN_PROXY_WORKSPACE_HOST_ROOT") {
        sandbox.insert("workspace_host_root".to_string(), Value::from(root));
    }
    if let Some(enabled) = read("RUN_PROXY_TERMINAL_ENABLED") {
        let enabled = enabled == "1" || enabled.eq_ignore_ascii_case("true");
        sandbox.insert("terminal_enabled".to_string(), Value::from(enabled));
    }
    if !sandbox.is_empty() {
        top.insert("sandbox".to_string(), Value::Object(sandbox));
    }

    if !top.is_empty() {
        merge_values(raw, Value::Object(top));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "orchestrator_url": "ws://127.0.0.1:3000/ws/agent",
            "sandbox": {
                "provider": "host_process",
                "workspace_host_root": "/srv/runs",
                "env": { "A": "1" }
            },
            "profiles": {
                "docker": {
                    "sandbox": {
                        "provider": "container_oci",
                        "image": "agent:latest",
                        "runtime": "docker",
                        "env": { "B": "2" }
                    }
                }
            }
        })
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_fill_optional_fields() {
        let config = resolve_config(base(), None, no_env).expect("config");
        assert_eq!(config.heartbeat_seconds, 30);
        assert_eq!(config.agent_command, vec!["npx", "--yes", "@zed-industries/codex-acp"]);
        assert_eq!(config.agent.max_concurrent, 1);
        assert_eq!(config.inputs_download_max_bytes, 200 * 1024 * 1024);
        assert_eq!(config.sandbox.provider, ProviderKind::HostProcess);
        assert_eq!(config.sandbox.bwrap.bin, "bwrap");
        assert!(config.sandbox.bwrap.user_view);
        assert!(!config.sandbox.terminal_enabled);
    }

    #[test]
    fn profile_deep_merges_over_base() {
        let config = resolve_config(base(), Some("docker"), no_env).expect("config");
        assert_eq!(config.sandbox.provider, ProviderKind::ContainerOci);
        assert_eq!(config.sandbox.image.as_deref(), Some("agent:latest"));
        assert_eq!(config.sandbox.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(config.sandbox.env.get("B").map(String::as_str), Some("2"));
        assert_eq!(config.sandbox.workspace_host_root, PathBuf::from("/srv/runs"));
    }

    #[test]
    fn missing_profile_is_an_error() {
        let err = resolve_config(base(), Some("nope"), no_env).expect_err("missing profile");
        assert!(matches!(err, ConfigError::ProfileNotFound(name) if name == "nope"));
    }

    #[test]
    fn env_overrides_win_over_file_and_profile() {
        let env = |key: &str| match key {
            "RUN_PROXY_ORCHESTRATOR_URL" => Some(" wss://orchestrator.example/ws ".to_string()),
            "RUN_PROXY_AUTH_TOKEN" => Some("secret-token".to_string()),
            "RUN_PROXY_CONTAINER_RUNTIME" => Some("podman".to_string()),
            "RUN_PROXY_TERMINAL_ENABLED" => Some("TRUE".to_string()),
            "RUN_PROXY_WORKSPACE_HOST_ROOT" => Some("/data/runs".to_string()),
            _ => None,
        };
        let config = resolve_config(base(), Some("docker"), env).expect("config");
        assert_eq!(config.orchestrator_url, "wss://orchestrator.example/ws");
        assert_eq!(config.auth_token(), Some("secret-token"));
        assert_eq!(config.sandbox.runtime.as_deref(), Some("podman"));
        assert!(config.sandbox.terminal_enabled);
        assert_eq!(config.sandbox.workspace_host_root, PathBuf::from("/data/runs"));
    }

    #[test]
    fn unknown_provider_env_is_rejected() {
        let env = |key: &str| (key == "RUN_PROXY_SANDBOX_PROVIDER").then(|| "vmware".to_string());
        let err = resolve_config(base(), None, env).expect_err("unknown provider");
        assert!(matches!(err, ConfigError::UnknownProvider(value) if value == "vmware"));
    }

    #[test]
    fn container_provider_requires_a_known_runtime() {
        let mut raw = base();
        raw["sandbox"] = json!({
            "provider": "container_oci",
            "workspace_host_root": "/srv/runs",
            "image": "agent:latest"
        });
        let err = resolve_config(raw.clone(), None, no_env).expect_err("runtime missing");
        assert!(err.to_string().contains("sandbox.runtime is required"));

        raw["sandbox"]["runtime"] = json!("lxc");
        let err = resolve_config(raw, None, no_env).expect_err("unknown runtime");
        assert!(err.to_string().contains("unsupported container runtime: lxc"));
    }

    #[test]
    fn boxlite_requires_image_and_workspace_root_is_required() {
        let mut raw = base();
        raw["sandbox"] = json!({ "provider": "boxlite", "workspace_host_root": "/srv/runs" });
        assert!(resolve_config(raw.clone(), None, no_env)
            .expect_err("image")
            .to_string()
            .contains("sandbox.image is required for boxlite"));

        raw["sandbox"] = json!({ "provider": "host_process" });
        assert!(resolve_config(raw, None, no_env)
            .expect_err("root")
            .to_string()
            .contains("workspace_host_root is required"));
    }

    #[test]
    fn toml_documents_parse_with_volumes() {
        let text = r#"
orchestrator_url = "ws://localhost:3000/ws/agent"
agent_env_allowlist = ["OPENAI_API_KEY"]

[agent]
id = "builder-1"

[sandbox]
provider = "bwrap"
workspace_host_root = "/srv/runs"

[[sandbox.volumes]]
host_path = "/opt/tools"
guest_path = "/opt/tools"
read_only = true

[sandbox.bwrap]
user_view = false
"#;
        let raw = parse_document(text, true).expect("toml");
        let config = resolve_config(raw, None, no_env).expect("config");
        assert_eq!(config.agent.id.as_deref(), Some("builder-1"));
        assert_eq!(config.agent_env_allowlist, vec!["OPENAI_API_KEY"]);
        assert!(!config.sandbox.bwrap.user_view);
        let mounts = config.sandbox.volume_mounts();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].to_volume_arg(), "/opt/tools:/opt/tools:ro");
    }

    #[test]
    fn load_config_reads_json_files_by_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proxy.json");
        let mut raw = base();
        if let Some(root) = raw.as_object_mut() {
            root.remove("profiles");
        }
        std::fs::write(&path, raw.to_string()).expect("write");
        let config = load_config(&path, None).expect("load");
        assert_eq!(config.orchestrator_url, "ws://127.0.0.1:3000/ws/agent");
    }
}
