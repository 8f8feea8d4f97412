use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use acp_stdio_bridge::process::format_command_for_display;
use acp_stdio_bridge::ProcessHandle;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use super::command::{args, run_capture, run_checked, DEFAULT_CLI_TIMEOUT};
use super::{
    normalize_guest_cwd, EnsureRunningOpts, ExecOpts, InstanceInfo, InstanceStatus, Mount, OpenAgentOpts,
    OpenedAgent, SandboxError, LABEL_AGENT_MODE, LABEL_MANAGED, LABEL_RUN_ID, WORKSPACE_GUEST_ROOT,
};
use crate::config::SandboxConfig;

/// What the backend needs to create a box.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoxSpec {
    pub name: String,
    pub image: String,
    pub labels: Vec<(String, String)>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub cpus: Option<f64>,
    pub memory_mib: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoxListing {
    pub info: InstanceInfo,
    pub labels: BTreeMap<String, String>,
}

/// Lifecycle and exec primitives of a micro-VM engine.
pub trait MicroVmBackend: Send + Sync + fmt::Debug {
    fn inspect<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<InstanceInfo, SandboxError>>;

    fn create<'a>(&'a self, spec: &'a BoxSpec) -> BoxFuture<'a, Result<(), SandboxError>>;

    fn start<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), SandboxError>>;

    fn stop<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), SandboxError>>;

    fn remove<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), SandboxError>>;

    fn list(&self) -> BoxFuture<'_, Result<Vec<BoxListing>, SandboxError>>;

    fn exec(&self, opts: &ExecOpts) -> Result<ProcessHandle, SandboxError>;
}

/// Hardware requirements of the micro-VM engine on this host.
pub fn check_platform() -> Result<(), SandboxError> {
    if cfg!(windows) {
        return Err(SandboxError::PlatformUnsupported(
            "boxlite does not support Windows; use sandbox.provider=host_process or run under Linux/WSL2".to_string(),
        ));
    }
    if cfg!(target_os = "macos") {
        if cfg!(target_arch = "aarch64") {
            return Ok(());
        }
        return Err(SandboxError::PlatformUnsupported(
            "boxlite on macOS requires Apple Silicon (arm64)".to_string(),
        ));
    }
    if cfg!(target_os = "linux") {
        return std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/kvm")
            .map(|_| ())
            .map_err(|err| {
                SandboxError::PlatformUnsupported(format!(
                    "boxlite requires read/write access to /dev/kvm (hardware virtualization): {err}"
                ))
            });
    }
    Err(SandboxError::PlatformUnsupported(format!(
        "boxlite does not support platform {}",
        std::env::consts::OS
    )))
}

fn map_box_status(raw: &str) -> InstanceStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "running" | "started" => InstanceStatus::Running,
        "stopped" | "exited" | "created" | "paused" => InstanceStatus::Stopped,
        "creating" | "starting" => InstanceStatus::Creating,
        "" | "missing" | "not_found" => InstanceStatus::Missing,
        _ => InstanceStatus::Error,
    }
}

#[derive(Debug, Deserialize)]
struct BoxRecord {
    #[serde(default, alias = "Name")]
    name: String,
    #[serde(default, alias = "State", alias = "Status")]
    status: String,
    #[serde(default, alias = "createdAt", alias = "CreatedAt")]
    created_at: Option<String>,
    #[serde(default, alias = "Labels")]
    labels: Option<BTreeMap<String, String>>,
}

/// `inspect` may print a single object or a one-element array.
fn parse_box_records(raw: &str) -> Result<Vec<BoxRecord>, serde_json::Error> {
    let value: Value = serde_json::from_str(raw.trim())?;
    match value {
        Value::Array(items) => items.into_iter().map(serde_json::from_value).collect(),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}

/// Drives the `boxlite` command line.
#[derive(Debug)]
pub struct BoxliteCli {
    program: String,
    timeout: Duration,
}

impl BoxliteCli {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            program: config.boxlite.cli.clone(),
            timeout: DEFAULT_CLI_TIMEOUT,
        }
    }

    pub fn create_args(spec: &BoxSpec) -> Vec<String> {
        let mut out = args(["create", "--name"]);
        out.push(spec.name.clone());
        for (key, value) in &spec.labels {
            out.extend(["--label".to_string(), format!("{key}={value}")]);
        }
        for (key, value) in &spec.env {
            out.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        for mount in &spec.mounts {
            out.extend(["-v".to_string(), mount.to_volume_arg()]);
        }
        if let Some(cpus) = spec.cpus {
            out.extend(["--cpus".to_string(), cpus.to_string()]);
        }
        if let Some(memory) = spec.memory_mib {
            out.extend(["--memory".to_string(), memory.to_string()]);
        }
        out.push(spec.image.clone());
        out
    }

    pub fn exec_args(opts: &ExecOpts) -> Vec<String> {
        let mut out = args(["exec", "-i", "-w"]);
        out.push(opts.cwd_in_guest.clone());
        for (key, value) in &opts.env {
            out.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        out.push(opts.instance_name.clone());
        out.push("--".to_string());
        out.extend(opts.command.iter().cloned());
        out
    }

    async fn simple(&self, verb: &str, name: &str) -> Result<(), SandboxError> {
        run_checked(&self.program, &args([verb, name]), self.timeout)
            .await
            .map(|_| ())
    }
}

impl MicroVmBackend for BoxliteCli {
    fn inspect<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<InstanceInfo, SandboxError>> {
        async move {
            let inspect = args(["inspect", name]);
            let output = run_capture(&self.program, &inspect, self.timeout, None).await?;
            if !output.success() {
                let combined = output.combined();
                if combined.to_ascii_lowercase().contains("not found") || combined.contains("no such") {
                    return Ok(InstanceInfo::missing(name));
                }
                return Err(SandboxError::Command {
                    command: format_command_for_display(&self.program, &inspect),
                    message: combined,
                });
            }
            let record = parse_box_records(&output.stdout)
                .map_err(|err| SandboxError::Command {
                    command: format_command_for_display(&self.program, &inspect),
                    message: format!("unparsable inspect output: {err}"),
                })?
                .into_iter()
                .next();
            Ok(match record {
                Some(record) => InstanceInfo {
                    instance_name: name.to_string(),
                    status: map_box_status(&record.status),
                    created_at: record.created_at,
                },
                None => InstanceInfo::missing(name),
            })
        }
        .boxed()
    }

    fn create<'a>(&'a self, spec: &'a BoxSpec) -> BoxFuture<'a, Result<(), SandboxError>> {
        async move {
            run_checked(&self.program, &Self::create_args(spec), self.timeout)
                .await
                .map(|_| ())
        }
        .boxed()
    }

    fn start<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), SandboxError>> {
        self.simple("start", name).boxed()
    }

    fn stop<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), SandboxError>> {
        self.simple("stop", name).boxed()
    }

    fn remove<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), SandboxError>> {
        async move {
            let rm = args(["rm", "-f", name]);
            let output = run_capture(&self.program, &rm, self.timeout, None).await?;
            if output.success() || output.combined().to_ascii_lowercase().contains("not found") {
                return Ok(());
            }
            Err(SandboxError::Command {
                command: format_command_for_display(&self.program, &rm),
                message: output.combined(),
            })
        }
        .boxed()
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<BoxListing>, SandboxError>> {
        async move {
            let ls = args(["ls", "--format", "json"]);
            let output = run_checked(&self.program, &ls, self.timeout).await?;
            if output.stdout.trim().is_empty() {
                return Ok(Vec::new());
            }
            let records = parse_box_records(&output.stdout).map_err(|err| SandboxError::Command {
                command: format_command_for_display(&self.program, &ls),
                message: format!("unparsable ls output: {err}"),
            })?;
            Ok(records
                .into_iter()
                .filter(|record| !record.name.trim().is_empty())
                .map(|record| BoxListing {
                    info: InstanceInfo {
                        instance_name: record.name,
                        status: map_box_status(&record.status),
                        created_at: record.created_at,
                    },
                    labels: record.labels.unwrap_or_default(),
                })
                .collect())
        }
        .boxed()
    }

    fn exec(&self, opts: &ExecOpts) -> Result<ProcessHandle, SandboxError> {
        let exec = Self::exec_args(opts);
        let display = format_command_for_display(&self.program, &exec);
        let mut command = Command::new(&self.program);
        command.args(&exec);
        Ok(ProcessHandle::spawn(command, display)?)
    }
}

/// Micro-VM isolation. The agent is exec'd into a long-lived box.
#[derive(Debug)]
pub struct MicroVmSandbox {
    backend: Box<dyn MicroVmBackend>,
    image: String,
    working_dir: Option<String>,
    volumes: Vec<Mount>,
    env: BTreeMap<String, String>,
    cpus: Option<f64>,
    memory_mib: Option<u64>,
    platform_check: bool,
}

impl MicroVmSandbox {
    pub fn new(config: &SandboxConfig, backend: Box<dyn MicroVmBackend>) -> Self {
        Self {
            backend,
            image: config.image.clone().unwrap_or_default(),
            working_dir: config.working_dir.clone().filter(|dir| !dir.trim().is_empty()),
            volumes: config.volume_mounts(),
            env: config.env.clone(),
            cpus: config.cpus,
            memory_mib: config.memory_mib,
            platform_check: true,
        }
    }

    #[cfg(test)]
    fn without_platform_check(mut self) -> Self {
        self.platform_check = false;
        self
    }

    fn check_platform(&self) -> Result<(), SandboxError> {
        if self.platform_check {
            check_platform()
        } else {
            Ok(())
        }
    }

    pub async fn inspect_instance(&self, instance_name: &str) -> Result<InstanceInfo, SandboxError> {
        self.backend.inspect(instance_name).await
    }

    pub async fn ensure_instance_running(&self, opts: &EnsureRunningOpts) -> Result<InstanceInfo, SandboxError> {
        self.check_platform()?;
        let before = self.backend.inspect(&opts.instance_name).await?;
        match before.status {
            InstanceStatus::Running => return Ok(before),
            InstanceStatus::Missing => {
                let mut env = self.env.clone();
                env.extend(opts.env.clone());
                let mut labels = vec![
                    (LABEL_MANAGED.to_string(), "1".to_string()),
                    (LABEL_AGENT_MODE.to_string(), "exec".to_string()),
                ];
                if !opts.run_id.trim().is_empty() {
                    labels.push((LABEL_RUN_ID.to_string(), opts.run_id.trim().to_string()));
                }
                let spec = BoxSpec {
                    name: opts.instance_name.clone(),
                    image: self.image.clone(),
                    labels,
                    env,
                    mounts: self.volumes.iter().chain(opts.mounts.iter()).cloned().collect(),
                    cpus: self.cpus,
                    memory_mib: self.memory_mib,
                };
                tracing::info!(instance_name = %opts.instance_name, image = %self.image, "creating micro-vm box");
                self.backend.create(&spec).await?;
                self.backend.start(&opts.instance_name).await?;
            }
            _ => self.backend.start(&opts.instance_name).await?,
        }
        let after = self.backend.inspect(&opts.instance_name).await?;
        if after.status == InstanceStatus::Missing {
            return Err(SandboxError::InstanceMissing {
                instance_name: opts.instance_name.clone(),
            });
        }
        Ok(after)
    }

    pub async fn exec_process(&self, opts: &ExecOpts) -> Result<ProcessHandle, SandboxError> {
        self.check_platform()?;
        let cwd = normalize_guest_cwd(&opts.cwd_in_guest)?;
        let info = self.backend.inspect(&opts.instance_name).await?;
        if info.status == InstanceStatus::Missing {
            return Err(SandboxError::InstanceMissing {
                instance_name: opts.instance_name.clone(),
            });
        }
        let mut env = self.env.clone();
        env.extend(opts.env.clone());
        self.backend.exec(&ExecOpts {
            instance_name: opts.instance_name.clone(),
            command: opts.command.clone(),
            cwd_in_guest: cwd,
            env,
        })
    }

    pub async fn open_agent(&self, opts: &OpenAgentOpts) -> Result<OpenedAgent, SandboxError> {
        self.check_platform()?;
        let before = self.backend.inspect(&opts.instance_name).await?;
        let created = before.status == InstanceStatus::Missing;
        self.ensure_instance_running(&EnsureRunningOpts {
            run_id: opts.run_id.clone(),
            instance_name: opts.instance_name.clone(),
            workspace_guest_path: opts.workspace_guest_path.clone(),
            env: BTreeMap::new(),
            mounts: opts.mounts.clone(),
        })
        .await?;
        let cwd = self
            .working_dir
            .clone()
            .unwrap_or_else(|| match opts.workspace_guest_path.trim() {
                "" => WORKSPACE_GUEST_ROOT.to_string(),
                path => path.to_string(),
            });
        tracing::info!(instance_name = %opts.instance_name, created, "starting micro-vm agent");
        let handle = self
            .exec_process(&ExecOpts {
                instance_name: opts.instance_name.clone(),
                command: opts.agent_command.clone(),
                cwd_in_guest: cwd,
                env: opts.env.clone(),
            })
            .await?;
        Ok(OpenedAgent {
            handle,
            created,
            init_pending: false,
        })
    }

    pub async fn list_instances(&self, managed_only: bool) -> Result<Vec<InstanceInfo>, SandboxError> {
        Ok(self
            .backend
            .list()
            .await?
            .into_iter()
            .filter(|listing| !managed_only || listing.labels.get(LABEL_MANAGED).map(String::as_str) == Some("1"))
            .map(|listing| listing.info)
            .collect())
    }

    pub async fn stop_instance(&self, instance_name: &str) -> Result<(), SandboxError> {
        if self.backend.inspect(instance_name).await?.status == InstanceStatus::Missing {
            return Ok(());
        }
        self.backend.stop(instance_name).await
    }

    pub async fn remove_instance(&self, instance_name: &str) -> Result<(), SandboxError> {
        self.backend.remove(instance_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use insta::assert_snapshot;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct FakeBackend {
        boxes: Mutex<BTreeMap<String, InstanceStatus>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn record(&self, call: String) {
            self.calls.lock().expect("calls").push(call);
        }

        fn set(&self, name: &str, status: InstanceStatus) {
            self.boxes.lock().expect("boxes").insert(name.to_string(), status);
        }
    }

    impl MicroVmBackend for std::sync::Arc<FakeBackend> {
        fn inspect<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<InstanceInfo, SandboxError>> {
            let status = self.boxes.lock().expect("boxes").get(name).copied();
            async move {
                Ok(match status {
                    Some(status) => InstanceInfo {
                        instance_name: name.to_string(),
                        status,
                        created_at: Some("2026-01-01T00:00:00Z".to_string()),
                    },
                    None => InstanceInfo::missing(name),
                })
            }
            .boxed()
        }

        fn create<'a>(&'a self, spec: &'a BoxSpec) -> BoxFuture<'a, Result<(), SandboxError>> {
            self.record(format!("create {}", spec.name));
            self.set(&spec.name, InstanceStatus::Stopped);
            async { Ok(()) }.boxed()
        }

        fn start<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), SandboxError>> {
            self.record(format!("start {name}"));
            self.set(name, InstanceStatus::Running);
            async { Ok(()) }.boxed()
        }

        fn stop<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), SandboxError>> {
            self.record(format!("stop {name}"));
            self.set(name, InstanceStatus::Stopped);
            async { Ok(()) }.boxed()
        }

        fn remove<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), SandboxError>> {
            self.record(format!("remove {name}"));
            self.boxes.lock().expect("boxes").remove(name);
            async { Ok(()) }.boxed()
        }

        fn list(&self) -> BoxFuture<'_, Result<Vec<BoxListing>, SandboxError>> {
            let rows = self
                .boxes
                .lock()
                .expect("boxes")
                .iter()
                .map(|(name, status)| BoxListing {
                    info: InstanceInfo {
                        instance_name: name.clone(),
                        status: *status,
                        created_at: None,
                    },
                    labels: BTreeMap::from([(LABEL_MANAGED.to_string(), "1".to_string())]),
                })
                .collect();
            async { Ok(rows) }.boxed()
        }

        fn exec(&self, opts: &ExecOpts) -> Result<ProcessHandle, SandboxError> {
            self.record(format!("exec {} {} {}", opts.instance_name, opts.cwd_in_guest, opts.command.join(" ")));
            Ok(ProcessHandle::spawn(Command::new("true"), "true")?)
        }
    }

    fn sandbox() -> (MicroVmSandbox, std::sync::Arc<FakeBackend>) {
        let mut config = SandboxConfig::for_provider(ProviderKind::Boxlite, PathBuf::from("/srv/runs"));
        config.image = Some("agent:latest".to_string());
        let backend = std::sync::Arc::new(FakeBackend::default());
        let sandbox = MicroVmSandbox::new(&config, Box::new(backend.clone())).without_platform_check();
        (sandbox, backend)
    }

    fn open_opts() -> OpenAgentOpts {
        OpenAgentOpts {
            run_id: "5".to_string(),
            instance_name: "run-proxy-run-5".to_string(),
            workspace_guest_path: "/workspace".to_string(),
            agent_command: vec!["codex-acp".to_string()],
            ..OpenAgentOpts::default()
        }
    }

    #[tokio::test]
    async fn open_agent_creates_once_then_reuses_the_box() {
        let (sandbox, backend) = sandbox();
        let first = sandbox.open_agent(&open_opts()).await.expect("first open");
        assert!(first.created);
        assert!(!first.init_pending);
        let second = sandbox.open_agent(&open_opts()).await.expect("second open");
        assert!(!second.created);

        let calls = backend.calls.lock().expect("calls").clone();
        assert_eq!(
            calls,
            vec![
                "create run-proxy-run-5",
                "start run-proxy-run-5",
                "exec run-proxy-run-5 /workspace codex-acp",
                "exec run-proxy-run-5 /workspace codex-acp",
            ]
        );
    }

    #[tokio::test]
    async fn exec_checks_cwd_and_instance() {
        let (sandbox, backend) = sandbox();
        let opts = ExecOpts {
            instance_name: "run-proxy-run-5".to_string(),
            command: vec!["ls".to_string()],
            cwd_in_guest: "/workspace".to_string(),
            env: BTreeMap::new(),
        };
        assert!(matches!(
            sandbox.exec_process(&opts).await,
            Err(SandboxError::InstanceMissing { .. })
        ));
        backend.set("run-proxy-run-5", InstanceStatus::Running);
        let outside = ExecOpts {
            cwd_in_guest: "/etc".to_string(),
            ..opts.clone()
        };
        assert!(matches!(
            sandbox.exec_process(&outside).await,
            Err(SandboxError::CwdOutsideWorkspace)
        ));
        sandbox.exec_process(&opts).await.expect("exec");
    }

    #[tokio::test]
    async fn stop_skips_missing_boxes() {
        let (sandbox, backend) = sandbox();
        sandbox.stop_instance("ghost").await.expect("noop");
        assert!(backend.calls.lock().expect("calls").is_empty());
        backend.set("b", InstanceStatus::Running);
        assert_eq!(sandbox.list_instances(true).await.expect("list").len(), 1);
    }

    #[test]
    fn boxlite_cli_arguments() {
        let spec = BoxSpec {
            name: "run-proxy-run-5".to_string(),
            image: "agent:latest".to_string(),
            labels: vec![(LABEL_MANAGED.to_string(), "1".to_string())],
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            mounts: vec![Mount {
                host_path: PathBuf::from("/srv/runs/run-5"),
                guest_path: "/workspace".to_string(),
                read_only: false,
            }],
            cpus: Some(2.0),
            memory_mib: Some(1024),
        };
        assert_snapshot!(BoxliteCli::create_args(&spec).join(" "), @"create --name run-proxy-run-5 --label run-proxy.managed=1 -e A=1 -v /srv/runs/run-5:/workspace --cpus 2 --memory 1024 agent:latest");

        let exec = ExecOpts {
            instance_name: "run-proxy-run-5".to_string(),
            command: vec!["codex-acp".to_string(), "--stdio".to_string()],
            cwd_in_guest: "/workspace".to_string(),
            env: BTreeMap::new(),
        };
        assert_snapshot!(BoxliteCli::exec_args(&exec).join(" "), @"exec -i -w /workspace run-proxy-run-5 -- codex-acp --stdio");
    }

    #[test]
    fn box_records_accept_object_or_array() {
        let one = parse_box_records(r#"{"name":"a","status":"running","created_at":"t"}"#).expect("object");
        assert_eq!(one.len(), 1);
        assert_eq!(map_box_status(&one[0].status), InstanceStatus::Running);
        let many = parse_box_records(r#"[{"Name":"a","State":"stopped"},{"name":"b"}]"#).expect("array");
        assert_eq!(many.len(), 2);
        assert_eq!(map_box_status(&many[0].status), InstanceStatus::Stopped);
    }
}
