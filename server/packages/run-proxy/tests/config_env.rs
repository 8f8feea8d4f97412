use std::path::Path;

use run_proxy::config::{load_config, ProviderKind};
use run_proxy::identity::{load_or_create_agent_id, AGENT_ID_ENV, IDENTITY_PATH_ENV};
use serial_test::serial;

const OVERRIDES: [&str; 5] = [
    "RUN_PROXY_ORCHESTRATOR_URL",
    "RUN_PROXY_SANDBOX_PROVIDER",
    "RUN_PROXY_SANDBOX_IMAGE",
    "RUN_PROXY_WORKSPACE_HOST_ROOT",
    "RUN_PROXY_TERMINAL_ENABLED",
];

fn clear_env() {
    for key in OVERRIDES.iter().chain([&AGENT_ID_ENV, &IDENTITY_PATH_ENV]) {
        std::env::remove_var(key);
    }
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("proxy.toml");
    std::fs::write(
        &path,
        r#"
orchestrator_url = "ws://orchestrator.local/agents"

[sandbox]
provider = "host_process"
workspace_host_root = "/srv/runs"

[profiles.vm.sandbox]
provider = "boxlite"
image = "ghcr.io/acme/agent:1"
"#,
    )
    .expect("write config");
    path
}

#[test]
#[serial]
fn process_env_overrides_the_file() {
    clear_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path());

    std::env::set_var("RUN_PROXY_ORCHESTRATOR_URL", "wss://other.example/agents");
    std::env::set_var("RUN_PROXY_TERMINAL_ENABLED", "true");
    std::env::set_var("RUN_PROXY_WORKSPACE_HOST_ROOT", "/data/runs");
    let config = load_config(&path, None).expect("load");
    clear_env();

    assert_eq!(config.orchestrator_url, "wss://other.example/agents");
    assert!(config.sandbox.terminal_enabled);
    assert_eq!(config.sandbox.workspace_host_root, Path::new("/data/runs"));
    assert_eq!(config.sandbox.provider, ProviderKind::HostProcess);
}

#[test]
#[serial]
fn env_provider_applies_on_top_of_a_profile() {
    clear_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path());

    let profiled = load_config(&path, Some("vm")).expect("profile");
    assert_eq!(profiled.sandbox.provider, ProviderKind::Boxlite);
    assert_eq!(profiled.sandbox.image.as_deref(), Some("ghcr.io/acme/agent:1"));

    std::env::set_var("RUN_PROXY_SANDBOX_PROVIDER", "bwrap");
    let overridden = load_config(&path, Some("vm"));
    std::env::set_var("RUN_PROXY_SANDBOX_PROVIDER", "chroot");
    let rejected = load_config(&path, None);
    clear_env();

    assert_eq!(overridden.expect("override").sandbox.provider, ProviderKind::Bwrap);
    assert!(rejected.is_err());
}

#[test]
#[serial]
fn agent_id_comes_from_env_then_the_identity_file() {
    clear_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let identity = dir.path().join("nested").join("identity.json");

    std::env::set_var(IDENTITY_PATH_ENV, &identity);
    let first = load_or_create_agent_id().expect("create");
    let second = load_or_create_agent_id().expect("reload");
    std::env::set_var(AGENT_ID_ENV, "  pinned-agent  ");
    let pinned = load_or_create_agent_id().expect("env id");
    clear_env();

    assert_eq!(first, second);
    assert!(identity.is_file());
    assert_eq!(pinned, "pinned-agent");
}
