use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use acp_stdio_bridge::process::format_command_for_display;
use acp_stdio_bridge::{ExitInfo, ProcessHandle};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};

use super::registry::terminate_process;
use super::{
    guest_to_host, now_rfc3339, resolve_workspace_host_path, EnsureRunningOpts, ExecOpts, InstanceInfo,
    InstanceStatus, Mount, OpenAgentOpts, OpenedAgent, SandboxError,
};
use crate::config::SandboxConfig;

/// An instance that only exists in this process: a workspace directory plus
/// whatever agent was last started for it.
#[derive(Debug, Clone)]
pub(crate) struct LocalInstance {
    pub(crate) run_id: Option<String>,
    pub(crate) workspace_host_path: PathBuf,
    pub(crate) mounts: Vec<Mount>,
    pub(crate) created_at: String,
    agent: Option<AgentSlot>,
}

impl LocalInstance {
    pub(crate) fn info(&self, instance_name: &str) -> InstanceInfo {
        InstanceInfo {
            instance_name: instance_name.to_string(),
            status: InstanceStatus::Running,
            created_at: Some(self.created_at.clone()),
        }
    }

    fn agent_running(&self) -> bool {
        self.agent.as_ref().is_some_and(AgentSlot::is_running)
    }
}

#[derive(Debug, Clone)]
struct AgentSlot {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl AgentSlot {
    fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }
}

/// In-memory instance table shared by the host and namespace variants.
#[derive(Debug, Default)]
pub(crate) struct LocalInstances {
    inner: Mutex<HashMap<String, LocalInstance>>,
}

impl LocalInstances {
    pub(crate) async fn get(&self, instance_name: &str) -> Option<LocalInstance> {
        self.inner.lock().await.get(instance_name).cloned()
    }

    pub(crate) async fn workspace_of(&self, instance_name: &str) -> Option<PathBuf> {
        self.inner
            .lock()
            .await
            .get(instance_name)
            .map(|instance| instance.workspace_host_path.clone())
    }

    /// Creates the entry or refreshes its workspace. Returns the entry and
    /// whether it was created by this call.
    pub(crate) async fn upsert(
        &self,
        instance_name: &str,
        run_id: &str,
        workspace_host_path: PathBuf,
        mounts: &[Mount],
    ) -> (LocalInstance, bool) {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.get_mut(instance_name) {
            existing.workspace_host_path = workspace_host_path;
            if !mounts.is_empty() {
                existing.mounts = mounts.to_vec();
            }
            return (existing.clone(), false);
        }
        let run_id = run_id.trim();
        let instance = LocalInstance {
            run_id: (!run_id.is_empty()).then(|| run_id.to_string()),
            workspace_host_path,
            mounts: mounts.to_vec(),
            created_at: now_rfc3339(),
            agent: None,
        };
        inner.insert(instance_name.to_string(), instance.clone());
        (instance, true)
    }

    pub(crate) async fn attach_agent(&self, instance_name: &str, handle: &ProcessHandle) {
        if let Some(instance) = self.inner.lock().await.get_mut(instance_name) {
            instance.agent = Some(AgentSlot {
                pid: handle.pid(),
                exit: handle.exit_watch(),
            });
        }
    }

    /// Forgets the agent and returns its pid when it is still alive.
    pub(crate) async fn detach_agent(&self, instance_name: &str) -> Option<u32> {
        let mut inner = self.inner.lock().await;
        let slot = inner.get_mut(instance_name)?.agent.take()?;
        if slot.is_running() {
            slot.pid
        } else {
            None
        }
    }

    pub(crate) async fn remove(&self, instance_name: &str) -> Option<LocalInstance> {
        self.inner.lock().await.remove(instance_name)
    }

    pub(crate) async fn list(&self) -> Vec<(String, LocalInstance)> {
        let mut rows: Vec<_> = self
            .inner
            .lock()
            .await
            .iter()
            .map(|(name, instance)| (name.clone(), instance.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Terminates the running agent of `instance_name`, if any.
    pub(crate) async fn stop_agent(&self, instance_name: &str) {
        if let Some(pid) = self.detach_agent(instance_name).await {
            tracing::debug!(instance_name, pid, "terminating local agent");
            terminate_process(pid);
        }
    }

    pub(crate) async fn has_running_agent(&self, instance_name: &str) -> bool {
        self.inner
            .lock()
            .await
            .get(instance_name)
            .is_some_and(LocalInstance::agent_running)
    }
}

/// Runs commands directly on the host. Guest `/workspace` paths map 1:1 to
/// the Run's host workspace directory; there is no isolation.
#[derive(Debug)]
pub struct HostProcessSandbox {
    workspace_host_root: PathBuf,
    env: BTreeMap<String, String>,
    instances: LocalInstances,
}

impl HostProcessSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            workspace_host_root: config.workspace_host_root.clone(),
            env: config.env.clone(),
            instances: LocalInstances::default(),
        }
    }

    pub async fn inspect_instance(&self, instance_name: &str) -> InstanceInfo {
        match self.instances.get(instance_name).await {
            Some(instance) => instance.info(instance_name),
            None => InstanceInfo::missing(instance_name),
        }
    }

    pub async fn ensure_instance_running(&self, opts: &EnsureRunningOpts) -> Result<InstanceInfo, SandboxError> {
        let workspace = self.prepare_workspace(&opts.instance_name, &opts.run_id, &opts.mounts).await?;
        let (instance, _) = self
            .instances
            .upsert(&opts.instance_name, &opts.run_id, workspace, &opts.mounts)
            .await;
        Ok(instance.info(&opts.instance_name))
    }

    /// Resolves the host cwd for `cwd_in_guest`; the instance must exist.
    pub async fn host_cwd(&self, instance_name: &str, cwd_in_guest: &str) -> Result<PathBuf, SandboxError> {
        let workspace = self
            .instances
            .workspace_of(instance_name)
            .await
            .ok_or_else(|| SandboxError::InstanceMissing {
                instance_name: instance_name.to_string(),
            })?;
        guest_to_host(&workspace, cwd_in_guest)
    }

    pub async fn exec_process(&self, opts: &ExecOpts) -> Result<ProcessHandle, SandboxError> {
        let cwd = self.host_cwd(&opts.instance_name, &opts.cwd_in_guest).await?;
        tracing::info!(
            instance_name = %opts.instance_name,
            command = ?opts.command,
            cwd = %cwd.display(),
            "host_process exec"
        );
        self.spawn(&opts.command, &cwd, &opts.env)
    }

    pub async fn open_agent(&self, opts: &OpenAgentOpts) -> Result<OpenedAgent, SandboxError> {
        let workspace = self.prepare_workspace(&opts.instance_name, &opts.run_id, &opts.mounts).await?;
        let (_, created) = self
            .instances
            .upsert(&opts.instance_name, &opts.run_id, workspace.clone(), &opts.mounts)
            .await;
        if self.instances.has_running_agent(&opts.instance_name).await {
            tracing::warn!(instance_name = %opts.instance_name, "replacing running host agent");
            self.instances.stop_agent(&opts.instance_name).await;
        }

        tracing::info!(
            instance_name = %opts.instance_name,
            command = ?opts.agent_command,
            cwd = %workspace.display(),
            "host_process start agent"
        );
        let handle = self.spawn(&opts.agent_command, &workspace, &opts.env)?;
        self.instances.attach_agent(&opts.instance_name, &handle).await;
        Ok(OpenedAgent {
            handle,
            created,
            init_pending: false,
        })
    }

    pub async fn list_instances(&self) -> Vec<InstanceInfo> {
        self.instances
            .list()
            .await
            .into_iter()
            .map(|(name, instance)| instance.info(&name))
            .collect()
    }

    pub async fn stop_instance(&self, instance_name: &str) {
        self.instances.stop_agent(instance_name).await;
    }

    pub async fn remove_instance(&self, instance_name: &str) {
        self.stop_instance(instance_name).await;
        self.instances.remove(instance_name).await;
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

    fn spawn(
        &self,
        argv: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle, SandboxError> {
        let (program, args) = argv.split_first().ok_or(SandboxError::EmptyCommand)?;
        let mut command = Command::new(program);
        command.args(args).current_dir(cwd).envs(&self.env).envs(env);
        Ok(ProcessHandle::spawn(command, format_command_for_display(program, args))?)
    }
}
