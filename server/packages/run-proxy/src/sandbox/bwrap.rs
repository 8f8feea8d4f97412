use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use acp_stdio_bridge::process::format_command_for_display;
use acp_stdio_bridge::ProcessHandle;
use tokio::process::Command;

use super::host_process::LocalInstances;
use super::registry::{is_process_running, terminate_process, NativeRegistry, RegistryEntry};
use super::shell::is_env_name;
use super::{
    absolute_root, normalize_guest_cwd, normalize_guest_mount_path, resolve_workspace_host_path, EnsureRunningOpts,
    ExecOpts, InstanceInfo, InstanceStatus, Mount, OpenAgentOpts, OpenedAgent, SandboxError, WORKSPACE_GUEST_ROOT,
};
use crate::config::SandboxConfig;

const LINUX_ONLY: &str = "bubblewrap sandbox only supports Linux";

/// Identity the process sees inside the namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserView {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home_guest_path: String,
    pub passwd_host_path: PathBuf,
    pub group_host_path: PathBuf,
}

impl UserView {
    /// Reads the view from the process env: `RUN_PROXY_BWRAP_*` overrides
    /// first, then the usual `USER`/`HOME` variables.
    pub fn from_env(env: &BTreeMap<String, String>, etc_dir: &Path) -> Result<Self, SandboxError> {
        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| env.get(*key))
                .map(|value| value.trim())
                .find(|value| !value.is_empty())
                .map(str::to_string)
        };
        let username = first(&["RUN_PROXY_BWRAP_USERNAME", "USER", "LOGNAME"]).unwrap_or_else(|| "agent".to_string());
        let uid = first(&["RUN_PROXY_BWRAP_UID"])
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(1000);
        let gid = first(&["RUN_PROXY_BWRAP_GID", "RUN_PROXY_BWRAP_UID"])
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(uid);
        let home = first(&["RUN_PROXY_BWRAP_HOME_PATH", "USER_HOME", "HOME"]).unwrap_or_else(|| "/home/agent".to_string());
        Ok(Self {
            username,
            uid,
            gid,
            home_guest_path: normalize_guest_mount_path("home path", &home)?,
            passwd_host_path: etc_dir.join("passwd"),
            group_host_path: etc_dir.join("group"),
        })
    }

    pub fn passwd(&self) -> String {
        format!(
            "root:x:0:0:root:/root:/bin/sh\n{}:x:{}:{}:ACP User:{}:/bin/sh\n",
            self.username, self.uid, self.gid, self.home_guest_path
        )
    }

    pub fn group(&self) -> String {
        format!("root:x:0:\n{}:x:{}:\n", self.username, self.gid)
    }

    async fn write_files(&self) -> Result<(), SandboxError> {
        if let Some(parent) = self.passwd_host_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.passwd_host_path, self.passwd()).await?;
        tokio::fs::write(&self.group_host_path, self.group()).await?;
        Ok(())
    }
}

pub struct BwrapInvocation<'a> {
    pub workspace_host_path: &'a Path,
    pub mounts: &'a [Mount],
    pub cwd_in_guest: &'a str,
    pub command: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    pub user_view: Option<&'a UserView>,
}

/// Full `bwrap` argument vector (without the program name).
pub fn build_bwrap_args(invocation: &BwrapInvocation<'_>) -> Result<Vec<String>, SandboxError> {
    let cwd = normalize_guest_cwd(invocation.cwd_in_guest)?;
    let mut args: Vec<String> = ["--die-with-parent", "--new-session", "--unshare-all", "--share-net"]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
    let mut push = |items: &[&str]| args.extend(items.iter().map(|item| item.to_string()));

    if let Some(view) = invocation.user_view {
        let uid = view.uid.to_string();
        let gid = view.gid.to_string();
        push(&["--unshare-user", "--uid", uid.as_str(), "--gid", gid.as_str()]);
        push(&["--setenv", "HOME", view.home_guest_path.as_str()]);
        push(&["--setenv", "USER", view.username.as_str()]);
        push(&["--setenv", "LOGNAME", view.username.as_str()]);
    }

    push(&["--ro-bind", "/", "/", "--dev", "/dev", "--proc", "/proc", "--tmpfs", "/tmp"]);

    if let Some(view) = invocation.user_view {
        let passwd = view.passwd_host_path.display().to_string();
        let group = view.group_host_path.display().to_string();
        push(&["--ro-bind", passwd.as_str(), "/etc/passwd", "--ro-bind", group.as_str(), "/etc/group"]);
    }

    let workspace = invocation.workspace_host_path.display().to_string();
    push(&["--dir", WORKSPACE_GUEST_ROOT, "--bind", workspace.as_str(), WORKSPACE_GUEST_ROOT]);

    for mount in invocation.mounts {
        let guest = normalize_guest_mount_path("guestPath", &mount.guest_path)?;
        if guest == WORKSPACE_GUEST_ROOT {
            continue;
        }
        let host = if mount.host_path.is_absolute() {
            mount.host_path.clone()
        } else {
            std::env::current_dir()?.join(&mount.host_path)
        };
        if let Some(parent) = Path::new(&guest).parent().and_then(Path::to_str) {
            if !parent.is_empty() && parent != "/" {
                push(&["--dir", parent]);
            }
        }
        let flag = if mount.read_only { "--ro-bind" } else { "--bind" };
        let host = host.display().to_string();
        push(&[flag, host.as_str(), guest.as_str()]);
    }

    for (key, value) in invocation.env {
        if !is_env_name(key) {
            tracing::warn!(key = %key, "skipping env var with invalid name");
            continue;
        }
        push(&["--setenv", key.as_str(), value.as_str()]);
    }

    push(&["--chdir", cwd.as_str(), "--"]);
    args.extend(invocation.command.iter().cloned());
    Ok(args)
}

/// Namespace isolation through `bwrap`. Instances are tracked in memory and
/// mirrored to the native registry so a restarted proxy can still report
/// and reap them.
#[derive(Debug)]
pub struct BwrapSandbox {
    bin: String,
    user_view: bool,
    workspace_host_root: PathBuf,
    volumes: Vec<Mount>,
    env: BTreeMap<String, String>,
    instances: LocalInstances,
    registry: NativeRegistry,
}

impl BwrapSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        let root = absolute_root(&config.workspace_host_root).unwrap_or_else(|_| config.workspace_host_root.clone());
        Self {
            bin: config.bwrap.bin.clone(),
            user_view: config.bwrap.user_view,
            registry: NativeRegistry::for_workspace_root(&root),
            workspace_host_root: config.workspace_host_root.clone(),
            volumes: config.volume_mounts(),
            env: config.env.clone(),
            instances: LocalInstances::default(),
        }
    }

    fn ensure_linux() -> Result<(), SandboxError> {
        if cfg!(target_os = "linux") {
            Ok(())
        } else {
            Err(SandboxError::PlatformUnsupported(LINUX_ONLY.to_string()))
        }
    }

    pub async fn inspect_instance(&self, instance_name: &str) -> Result<InstanceInfo, SandboxError> {
        Self::ensure_linux()?;
        Ok(match self.instances.get(instance_name).await {
            Some(instance) => instance.info(instance_name),
            None => InstanceInfo::missing(instance_name),
        })
    }

    pub async fn ensure_instance_running(&self, opts: &EnsureRunningOpts) -> Result<InstanceInfo, SandboxError> {
        Self::ensure_linux()?;
        let workspace = self.prepare_workspace(&opts.instance_name, &opts.run_id, &opts.mounts).await?;
        let (instance, _) = self
            .instances
            .upsert(&opts.instance_name, &opts.run_id, workspace, &opts.mounts)
            .await;
        Ok(instance.info(&opts.instance_name))
    }

    pub async fn exec_process(&self, opts: &ExecOpts) -> Result<ProcessHandle, SandboxError> {
        Self::ensure_linux()?;
        let instance = self
            .instances
            .get(&opts.instance_name)
            .await
            .ok_or_else(|| SandboxError::InstanceMissing {
                instance_name: opts.instance_name.clone(),
            })?;
        let mounts = self.with_volumes(&instance.mounts);
        let user_view = self.prepare_user_view(&instance.workspace_host_path, &opts.env).await?;
        let args = build_bwrap_args(&BwrapInvocation {
            workspace_host_path: &instance.workspace_host_path,
            mounts: &mounts,
            cwd_in_guest: &opts.cwd_in_guest,
            command: &opts.command,
            env: &opts.env,
            user_view: user_view.as_ref(),
        })?;
        tracing::info!(instance_name = %opts.instance_name, command = ?opts.command, "bwrap exec");
        self.spawn(args, &instance.workspace_host_path)
    }

    pub async fn open_agent(&self, opts: &OpenAgentOpts) -> Result<OpenedAgent, SandboxError> {
        Self::ensure_linux()?;
        let workspace = self.prepare_workspace(&opts.instance_name, &opts.run_id, &opts.mounts).await?;
        let (instance, created) = self
            .instances
            .upsert(&opts.instance_name, &opts.run_id, workspace.clone(), &opts.mounts)
            .await;
        if self.instances.has_running_agent(&opts.instance_name).await {
            tracing::warn!(instance_name = %opts.instance_name, "replacing running bwrap agent");
            self.instances.stop_agent(&opts.instance_name).await;
        }

        let mut env = opts.env.clone();
        if let Some(init) = &opts.init {
            env.extend(init.env.iter().map(|(key, value)| (key.clone(), value.clone())));
        }
        let mounts = self.with_volumes(&opts.mounts);
        let user_view = self.prepare_user_view(&workspace, &env).await?;
        let args = build_bwrap_args(&BwrapInvocation {
            workspace_host_path: &workspace,
            mounts: &mounts,
            cwd_in_guest: &opts.workspace_guest_path,
            command: &opts.agent_command,
            env: &env,
            user_view: user_view.as_ref(),
        })?;

        tracing::info!(instance_name = %opts.instance_name, command = ?opts.agent_command, "bwrap start agent");
        let handle = self.spawn(args, &workspace)?;
        self.instances.attach_agent(&opts.instance_name, &handle).await;

        if let Some(pid) = handle.pid() {
            let entry = RegistryEntry {
                instance_name: opts.instance_name.clone(),
                pid,
                workspace_host_path: workspace.display().to_string(),
                started_at: instance.created_at.clone(),
            };
            if let Err(err) = self.registry.upsert(entry).await {
                tracing::warn!(instance_name = %opts.instance_name, error = %err, "bwrap registry write failed");
            }
        }

        Ok(OpenedAgent {
            handle,
            created,
            init_pending: false,
        })
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceInfo>, SandboxError> {
        Self::ensure_linux()?;
        let mut out: Vec<InstanceInfo> = self
            .instances
            .list()
            .await
            .into_iter()
            .map(|(name, instance)| instance.info(&name))
            .collect();
        for entry in self.registry.read().await {
            if out.iter().any(|info| info.instance_name == entry.instance_name) {
                continue;
            }
            out.push(InstanceInfo {
                status: if is_process_running(entry.pid) {
                    InstanceStatus::Running
                } else {
                    InstanceStatus::Missing
                },
                instance_name: entry.instance_name,
                created_at: Some(entry.started_at),
            });
        }
        Ok(out)
    }

    pub async fn stop_instance(&self, instance_name: &str) -> Result<(), SandboxError> {
        Self::ensure_linux()?;
        self.instances.stop_agent(instance_name).await;
        Ok(())
    }

    pub async fn remove_instance(&self, instance_name: &str) -> Result<(), SandboxError> {
        Self::ensure_linux()?;
        let recorded = self
            .registry
            .read()
            .await
            .into_iter()
            .find(|entry| entry.instance_name == instance_name);
        self.instances.stop_agent(instance_name).await;
        if let Some(entry) = recorded {
            if is_process_running(entry.pid) {
                terminate_process(entry.pid);
            }
        }
        self.instances.remove(instance_name).await;
        if let Err(err) = self.registry.remove(instance_name).await {
            tracing::warn!(instance_name, error = %err, "bwrap registry cleanup failed");
        }
        Ok(())
    }

    fn with_volumes(&self, mounts: &[Mount]) -> Vec<Mount> {
        mounts.iter().chain(self.volumes.iter()).cloned().collect()
    }

    async fn prepare_workspace(
        &self,
        instance_name: &str,
        run_id: &str,
        mounts: &[Mount],
    ) -> Result<PathBuf, SandboxError> {
        let existing = self.instances.workspace_of(instance_name).await;
        let workspace =
            resolve_workspace_host_path(&self.workspace_host_root, run_id, mounts, existing.as_deref())?;
        tokio::fs::create_dir_all(&workspace).await?;
        Ok(workspace)
    }

    async fn prepare_user_view(
        &self,
        workspace: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<Option<UserView>, SandboxError> {
        if !self.user_view {
            return Ok(None);
        }
        let etc_dir = workspace.join(".run-proxy").join("bwrap").join("etc");
        let view = UserView::from_env(env, &etc_dir)?;
        view.write_files().await?;
        Ok(Some(view))
    }

    fn spawn(&self, args: Vec<String>, host_cwd: &Path) -> Result<ProcessHandle, SandboxError> {
        let display = format_command_for_display(&self.bin, &args);
        let mut command = Command::new(&self.bin);
        command.args(&args).current_dir(host_cwd).envs(&self.env);
        Ok(ProcessHandle::spawn(command, display)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    fn mount(host: &str, guest: &str, read_only: bool) -> Mount {
        Mount {
            host_path: PathBuf::from(host),
            guest_path: guest.to_string(),
            read_only,
        }
    }

    #[test]
    fn bwrap_args_bind_workspace_and_mounts() {
        let mounts = [
            mount("/srv/runs/home-7", "/root", false),
            mount("/opt/tools", "/opt/tools", true),
            mount("/srv/runs/other", "/workspace", false),
        ];
        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        env.insert("bad-name".to_string(), "x".to_string());
        let command = vec!["codex-acp".to_string(), "--stdio".to_string()];
        let args = build_bwrap_args(&BwrapInvocation {
            workspace_host_path: Path::new("/srv/runs/run-7"),
            mounts: &mounts,
            cwd_in_guest: "/workspace/sub",
            command: &command,
            env: &env,
            user_view: None,
        })
        .expect("args");
        assert_snapshot!(args.join(" "), @"--die-with-parent --new-session --unshare-all --share-net --ro-bind / / --dev /dev --proc /proc --tmpfs /tmp --dir /workspace --bind /srv/runs/run-7 /workspace --bind /srv/runs/home-7 /root --dir /opt --ro-bind /opt/tools /opt/tools --setenv FOO bar --chdir /workspace/sub -- codex-acp --stdio");
    }

    #[test]
    fn user_view_maps_identity_and_overlays_passwd() {
        let mut env = BTreeMap::new();
        env.insert("USER".to_string(), "dev".to_string());
        env.insert("HOME".to_string(), "/home/dev".to_string());
        env.insert("RUN_PROXY_BWRAP_UID".to_string(), "1234".to_string());
        let view = UserView::from_env(&env, Path::new("/ws/.run-proxy/bwrap/etc")).expect("view");
        assert_eq!(view.gid, 1234);
        assert_eq!(view.passwd(), "root:x:0:0:root:/root:/bin/sh\ndev:x:1234:1234:ACP User:/home/dev:/bin/sh\n");
        assert_eq!(view.group(), "root:x:0:\ndev:x:1234:\n");

        let command = vec!["true".to_string()];
        let args = build_bwrap_args(&BwrapInvocation {
            workspace_host_path: Path::new("/ws"),
            mounts: &[],
            cwd_in_guest: "/workspace",
            command: &command,
            env: &BTreeMap::new(),
            user_view: Some(&view),
        })
        .expect("args");
        assert_snapshot!(args.join(" "), @"--die-with-parent --new-session --unshare-all --share-net --unshare-user --uid 1234 --gid 1234 --setenv HOME /home/dev --setenv USER dev --setenv LOGNAME dev --ro-bind / / --dev /dev --proc /proc --tmpfs /tmp --ro-bind /ws/.run-proxy/bwrap/etc/passwd /etc/passwd --ro-bind /ws/.run-proxy/bwrap/etc/group /etc/group --dir /workspace --bind /ws /workspace --chdir /workspace -- true");
    }

    #[test]
    fn user_view_defaults_to_agent() {
        let view = UserView::from_env(&BTreeMap::new(), Path::new("/etc-dir")).expect("view");
        assert_eq!(view.username, "agent");
        assert_eq!((view.uid, view.gid), (1000, 1000));
        assert_eq!(view.home_guest_path, "/home/agent");
    }

    #[test]
    fn bwrap_rejects_escaping_paths() {
        let command = vec!["true".to_string()];
        let env = BTreeMap::new();
        let escaping_mount = [mount("/tmp", "/data/../etc", false)];
        let base = BwrapInvocation {
            workspace_host_path: Path::new("/ws"),
            mounts: &escaping_mount,
            cwd_in_guest: "/workspace",
            command: &command,
            env: &env,
            user_view: None,
        };
        assert!(matches!(
            build_bwrap_args(&base),
            Err(SandboxError::InvalidGuestPath { .. })
        ));
        let bad_cwd = BwrapInvocation {
            mounts: &[],
            cwd_in_guest: "/etc",
            ..base
        };
        assert!(matches!(build_bwrap_args(&bad_cwd), Err(SandboxError::CwdOutsideWorkspace)));
    }

    #[cfg(not(target_os = "linux"))]
    #[tokio::test]
    async fn non_linux_hosts_fail_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SandboxConfig::for_provider(crate::config::ProviderKind::Bwrap, dir.path().to_path_buf());
        let err = BwrapSandbox::new(&config)
            .inspect_instance("x")
            .await
            .expect_err("platform");
        assert_eq!(err.to_string(), LINUX_ONLY);
    }
}
