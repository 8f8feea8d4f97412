use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use acp_stdio_bridge::process::format_command_for_display;
use acp_stdio_bridge::{ProcessHandle, INIT_MARKER_PREFIX};
use tokio::process::Command;

use super::command::{args, run_capture, run_checked, DEFAULT_CLI_TIMEOUT};
use super::shell::{ansi_c_quote, is_env_name, sh_quote};
use super::{
    EnsureRunningOpts, ExecOpts, InitSpec, InstanceInfo, InstanceStatus, Mount, OpenAgentOpts, OpenedAgent,
    SandboxError, LABEL_AGENT_MODE, LABEL_MANAGED, LABEL_RUN_ID, WORKSPACE_GUEST_ROOT,
};
use crate::config::SandboxConfig;

const INSPECT_FORMAT: &str = "{{.State.Status}}|{{.Created}}";
const LABELS_FORMAT: &str = "{{json .Config.Labels}}";
const PS_FORMAT: &str = "{{.Names}}\t{{.Status}}\t{{.CreatedAt}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerCli {
    Docker,
    Podman,
    Nerdctl,
}

impl ContainerCli {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
            Self::Nerdctl => "nerdctl",
        }
    }
}

impl FromStr for ContainerCli {
    type Err = SandboxError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            "nerdctl" => Ok(Self::Nerdctl),
            other => Err(SandboxError::UnknownContainerCli(other.to_string())),
        }
    }
}

impl fmt::Display for ContainerCli {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    Missing,
}

/// Shell program passed to `bash -lc` as the container entrypoint. It
/// exports the init env, runs the init script with its stdout folded into
/// stderr, reports the outcome through the init marker and finally execs
/// the agent command given as positional arguments.
pub fn build_entrypoint_script(working_dir: &str, init: Option<&InitSpec>) -> String {
    let mut lines = vec![
        "set -euo pipefail".to_string(),
        format!("workspace={}", sh_quote(working_dir)),
        r#"mkdir -p "$workspace" >/dev/null 2>&1 || true"#.to_string(),
    ];

    if let Some(init) = init {
        for (key, value) in &init.env {
            if is_env_name(key) {
                lines.push(format!("export {key}={}", ansi_c_quote(value)));
            }
        }
    }

    let script = init.map(|init| init.script.trim()).unwrap_or_default();
    if !script.is_empty() {
        lines.push(format!("marker={}", sh_quote(INIT_MARKER_PREFIX)));
        lines.push("set +e".to_string());
        lines.push("(".to_string());
        lines.push(script.to_string());
        lines.push(") 1>&2".to_string());
        lines.push("code=$?".to_string());
        lines.push("set -e".to_string());
        lines.push("if [ $code -ne 0 ]; then".to_string());
        lines.push(r#"  printf '%s{"ok":false,"exitCode":%s}\n' "$marker" "$code" >&2"#.to_string());
        lines.push("  exit $code".to_string());
        lines.push("fi".to_string());
        lines.push(r#"printf '%s{"ok":true}\n' "$marker" >&2"#.to_string());
    }

    lines.push("if [ $# -eq 0 ]; then".to_string());
    lines.push(r#"  echo "agent_command is empty" >&2"#.to_string());
    lines.push("  exit 2".to_string());
    lines.push("fi".to_string());
    lines.push(r#"exec "$@""#.to_string());
    lines.join("\n")
}

/// Everything a `<cli> run` needs.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub detach: bool,
    pub entrypoint: Option<String>,
    pub working_dir: String,
    pub labels: Vec<(String, String)>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub cpus: Option<f64>,
    pub memory_mib: Option<u64>,
    pub extra_args: Vec<String>,
    pub cmd: Vec<String>,
}

pub fn build_run_args(spec: &RunSpec) -> Vec<String> {
    let mut out = vec!["run".to_string()];
    out.push(if spec.detach { "-d" } else { "-i" }.to_string());
    out.extend(["--name".to_string(), spec.name.clone()]);
    if let Some(entrypoint) = &spec.entrypoint {
        out.extend(["--entrypoint".to_string(), entrypoint.clone()]);
    }
    if !spec.working_dir.is_empty() {
        out.extend(["-w".to_string(), spec.working_dir.clone()]);
    }
    for (key, value) in &spec.labels {
        out.extend(["--label".to_string(), format!("{key}={value}")]);
    }
    for (key, value) in &spec.env {
        if key.trim().is_empty() {
            continue;
        }
        out.extend(["-e".to_string(), format!("{key}={value}")]);
    }
    for mount in &spec.mounts {
        out.extend(["-v".to_string(), mount.to_volume_arg()]);
    }
    if let Some(cpus) = spec.cpus {
        out.extend(["--cpus".to_string(), cpus.to_string()]);
    }
    if let Some(memory) = spec.memory_mib {
        out.extend(["--memory".to_string(), format!("{memory}m")]);
    }
    out.extend(spec.extra_args.iter().cloned());
    out.push(spec.image.clone());
    out.extend(spec.cmd.iter().cloned());
    out
}

fn map_engine_status(raw: &str) -> InstanceStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "running" | "restarting" => InstanceStatus::Running,
        "created" | "exited" | "paused" | "stopped" | "dead" => InstanceStatus::Stopped,
        "creating" => InstanceStatus::Creating,
        _ => InstanceStatus::Error,
    }
}

fn is_missing_output(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no such object") || lower.contains("not found")
}

/// Parses `inspect --format '{{.State.Status}}|{{.Created}}'`.
pub fn parse_inspect_output(instance_name: &str, stdout: &str) -> InstanceInfo {
    let line = stdout.lines().map(str::trim).find(|line| !line.is_empty()).unwrap_or_default();
    let (status, created) = line.split_once('|').unwrap_or((line, ""));
    let created = created.trim();
    InstanceInfo {
        instance_name: instance_name.to_string(),
        status: map_engine_status(status),
        created_at: (!created.is_empty()).then(|| created.to_string()),
    }
}

/// Parses one `ps --format '{{.Names}}\t{{.Status}}\t{{.CreatedAt}}'` row.
/// `Status` is the human form (`Up 3 minutes`, `Exited (0) ...`).
pub fn parse_ps_line(line: &str) -> Option<InstanceInfo> {
    let mut fields = line.split('\t');
    let name = fields.next()?.trim().trim_start_matches('/');
    if name.is_empty() {
        return None;
    }
    let status = fields.next().unwrap_or_default().trim();
    let created = fields.next().unwrap_or_default().trim();
    let lower = status.to_ascii_lowercase();
    let status = if lower.starts_with("up") || lower.starts_with("running") {
        InstanceStatus::Running
    } else if lower.starts_with("exited") || lower.starts_with("created") || lower.starts_with("paused") {
        InstanceStatus::Stopped
    } else {
        map_engine_status(&lower)
    };
    Some(InstanceInfo {
        instance_name: name.to_string(),
        status,
        created_at: (!created.is_empty()).then(|| created.to_string()),
    })
}

/// Containers driven through a docker-compatible CLI. The agent runs as the
/// container entrypoint, so the container's lifetime follows the agent.
#[derive(Debug)]
pub struct ContainerSandbox {
    cli: ContainerCli,
    program: String,
    image: String,
    working_dir: Option<String>,
    volumes: Vec<Mount>,
    env: BTreeMap<String, String>,
    cpus: Option<f64>,
    memory_mib: Option<u64>,
    extra_run_args: Vec<String>,
    timeout: Duration,
}

impl ContainerSandbox {
    pub fn new(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let cli: ContainerCli = config.runtime.as_deref().unwrap_or("docker").parse()?;
        let image = config
            .image
            .as_deref()
            .map(str::trim)
            .filter(|image| !image.is_empty())
            .ok_or_else(|| SandboxError::Command {
                command: cli.to_string(),
                message: "sandbox.image missing".to_string(),
            })?;
        Ok(Self {
            cli,
            program: cli.as_str().to_string(),
            image: image.to_string(),
            working_dir: config
                .working_dir
                .as_deref()
                .map(str::trim)
                .filter(|dir| !dir.is_empty())
                .map(str::to_string),
            volumes: config.volume_mounts(),
            env: config.env.clone(),
            cpus: config.cpus,
            memory_mib: config.memory_mib,
            extra_run_args: config.extra_run_args.clone(),
            timeout: DEFAULT_CLI_TIMEOUT,
        })
    }

    #[cfg(test)]
    fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn cli(&self) -> ContainerCli {
        self.cli
    }

    pub async fn inspect_instance(&self, instance_name: &str) -> Result<InstanceInfo, SandboxError> {
        let inspect = args(["inspect", "--format", INSPECT_FORMAT, instance_name]);
        let output = run_capture(&self.program, &inspect, self.timeout, None).await?;
        if output.success() {
            return Ok(parse_inspect_output(instance_name, &output.stdout));
        }
        if is_missing_output(&output.combined()) {
            return Ok(InstanceInfo::missing(instance_name));
        }
        Err(SandboxError::Command {
            command: format_command_for_display(&self.program, &inspect),
            message: output.combined(),
        })
    }

    pub async fn instance_labels(&self, instance_name: &str) -> Result<BTreeMap<String, String>, SandboxError> {
        let output = run_checked(
            &self.program,
            &args(["inspect", "--format", LABELS_FORMAT, instance_name]),
            self.timeout,
        )
        .await?;
        let labels = serde_json::from_str::<Option<BTreeMap<String, String>>>(output.stdout.trim())
            .unwrap_or_else(|err| {
                tracing::warn!(instance_name, error = %err, "container labels are not a string map");
                None
            });
        Ok(labels.unwrap_or_default())
    }

    /// Starts a stopped container, or creates a standby one (kept alive with
    /// `sleep infinity`) when it is missing.
    pub async fn ensure_instance_running(&self, opts: &EnsureRunningOpts) -> Result<InstanceInfo, SandboxError> {
        let before = self.inspect_instance(&opts.instance_name).await?;
        match before.status {
            InstanceStatus::Running => return Ok(before),
            InstanceStatus::Missing => {
                let mut env = self.env.clone();
                env.extend(opts.env.clone());
                let spec = RunSpec {
                    name: opts.instance_name.clone(),
                    image: self.image.clone(),
                    detach: true,
                    entrypoint: Some("sleep".to_string()),
                    working_dir: self.working_dir_for(&opts.workspace_guest_path),
                    labels: self.labels(&opts.run_id, "standby"),
                    env,
                    mounts: self.mounts_with(&opts.mounts),
                    cpus: self.cpus,
                    memory_mib: self.memory_mib,
                    extra_args: self.extra_run_args.clone(),
                    cmd: vec!["infinity".to_string()],
                };
                tracing::info!(instance_name = %opts.instance_name, image = %self.image, "creating standby container");
                run_checked(&self.program, &build_run_args(&spec), self.timeout).await?;
            }
            _ => {
                run_checked(&self.program, &args(["start", opts.instance_name.as_str()]), self.timeout).await?;
            }
        }
        self.inspect_instance(&opts.instance_name).await
    }

    pub async fn exec_process(&self, opts: &ExecOpts) -> Result<ProcessHandle, SandboxError> {
        let mut exec = vec!["exec".to_string(), "-i".to_string()];
        if !opts.cwd_in_guest.trim().is_empty() {
            exec.extend(["-w".to_string(), opts.cwd_in_guest.clone()]);
        }
        for (key, value) in &opts.env {
            exec.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        exec.push(opts.instance_name.clone());
        exec.extend(opts.command.iter().cloned());
        self.spawn(exec, None)
    }

    pub async fn open_agent(&self, opts: &OpenAgentOpts) -> Result<OpenedAgent, SandboxError> {
        let init_script = opts
            .init
            .as_ref()
            .map(|init| init.script.trim())
            .unwrap_or_default()
            .to_string();
        let mut before = self.inspect_instance(&opts.instance_name).await?;

        if !init_script.is_empty() && before.status != InstanceStatus::Missing {
            tracing::info!(instance_name = %opts.instance_name, "removing container to rerun init");
            if let Err(err) = self.remove_instance(&opts.instance_name).await {
                tracing::warn!(instance_name = %opts.instance_name, error = %err, "container removal before init failed");
            }
            before = InstanceInfo::missing(&opts.instance_name);
        }

        if before.status != InstanceStatus::Missing {
            let labels = self.instance_labels(&opts.instance_name).await?;
            let mode = labels.get(LABEL_AGENT_MODE).map(String::as_str).unwrap_or_default();
            if !mode.is_empty() && mode != "entrypoint" {
                return Err(SandboxError::AgentModeMismatch {
                    instance_name: opts.instance_name.clone(),
                    label: LABEL_AGENT_MODE,
                    value: mode.to_string(),
                });
            }
        }

        match before.status {
            InstanceStatus::Missing => {
                let working_dir = self.working_dir_for(&opts.workspace_guest_path);
                let script = build_entrypoint_script(&working_dir, opts.init.as_ref());
                let mut cmd = vec!["-lc".to_string(), script, "--".to_string()];
                cmd.extend(opts.agent_command.iter().cloned());
                let mut env = self.env.clone();
                env.extend(opts.env.clone());
                let spec = RunSpec {
                    name: opts.instance_name.clone(),
                    image: self.image.clone(),
                    detach: false,
                    entrypoint: Some("bash".to_string()),
                    working_dir,
                    labels: self.labels(&opts.run_id, "entrypoint"),
                    env,
                    mounts: self.mounts_with(&opts.mounts),
                    cpus: self.cpus,
                    memory_mib: self.memory_mib,
                    extra_args: self.extra_run_args.clone(),
                    cmd,
                };
                tracing::info!(
                    instance_name = %opts.instance_name,
                    image = %self.image,
                    init = !init_script.is_empty(),
                    "starting container agent"
                );
                let handle = self.spawn(build_run_args(&spec), Some(&opts.instance_name))?;
                Ok(OpenedAgent {
                    handle,
                    created: true,
                    init_pending: !init_script.is_empty(),
                })
            }
            InstanceStatus::Running => {
                let handle = self.spawn(args(["attach", opts.instance_name.as_str()]), Some(&opts.instance_name))?;
                Ok(OpenedAgent {
                    handle,
                    created: false,
                    init_pending: false,
                })
            }
            _ => {
                let handle = self.spawn(args(["start", "-ai", opts.instance_name.as_str()]), Some(&opts.instance_name))?;
                Ok(OpenedAgent {
                    handle,
                    created: false,
                    init_pending: false,
                })
            }
        }
    }

    pub async fn list_instances(&self, managed_only: bool) -> Result<Vec<InstanceInfo>, SandboxError> {
        let mut ps = args(["ps", "-a"]);
        if managed_only {
            ps.extend(["--filter".to_string(), format!("label={LABEL_MANAGED}=1")]);
        }
        ps.extend(["--format".to_string(), PS_FORMAT.to_string()]);
        let output = run_checked(&self.program, &ps, self.timeout).await?;
        Ok(output.stdout.lines().filter_map(parse_ps_line).collect())
    }

    pub async fn stop_instance(&self, instance_name: &str) -> Result<(), SandboxError> {
        let stop = args(["stop", instance_name]);
        let output = run_capture(&self.program, &stop, self.timeout, None).await?;
        if output.success() || is_missing_output(&output.combined()) {
            return Ok(());
        }
        Err(SandboxError::Command {
            command: format_command_for_display(&self.program, &stop),
            message: output.combined(),
        })
    }

    pub async fn remove_instance(&self, instance_name: &str) -> Result<RemoveOutcome, SandboxError> {
        let rm = args(["rm", "-f", instance_name]);
        let output = run_capture(&self.program, &rm, self.timeout, None).await?;
        if output.success() {
            return Ok(RemoveOutcome::Removed);
        }
        let combined = output.combined();
        if is_missing_output(&combined) {
            return Ok(RemoveOutcome::Missing);
        }
        Err(SandboxError::Command {
            command: format_command_for_display(&self.program, &rm),
            message: combined,
        })
    }

    fn working_dir_for(&self, workspace_guest_path: &str) -> String {
        self.working_dir
            .clone()
            .or_else(|| {
                let guest = workspace_guest_path.trim();
                (!guest.is_empty()).then(|| guest.to_string())
            })
            .unwrap_or_else(|| WORKSPACE_GUEST_ROOT.to_string())
    }

    fn labels(&self, run_id: &str, agent_mode: &str) -> Vec<(String, String)> {
        let mut labels = vec![
            (LABEL_MANAGED.to_string(), "1".to_string()),
            (LABEL_AGENT_MODE.to_string(), agent_mode.to_string()),
        ];
        let run_id = run_id.trim();
        if !run_id.is_empty() {
            labels.push((LABEL_RUN_ID.to_string(), run_id.to_string()));
        }
        labels
    }

    fn mounts_with(&self, run_mounts: &[Mount]) -> Vec<Mount> {
        self.volumes.iter().chain(run_mounts.iter()).cloned().collect()
    }

    /// Spawns `<cli> args...`; with `kill_on_close` the container itself is
    /// killed when the handle closes, not just the attached CLI.
    fn spawn(&self, cli_args: Vec<String>, kill_on_close: Option<&str>) -> Result<ProcessHandle, SandboxError> {
        let display = format_command_for_display(&self.program, &cli_args);
        let mut command = Command::new(&self.program);
        command.args(&cli_args);
        let mut handle = ProcessHandle::spawn(command, display)?;
        if let Some(name) = kill_on_close {
            let program = self.program.clone();
            let name = name.to_string();
            handle.on_close(move || kill_container(program, name));
        }
        Ok(handle)
    }
}

fn kill_container(program: String, name: String) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(container = %name, "no runtime to kill container on close");
        return;
    };
    runtime.spawn(async move {
        match run_capture(&program, &args(["kill", name.as_str()]), Duration::from_secs(30), None).await {
            Ok(output) if !output.success() && !is_missing_output(&output.combined()) => {
                tracing::debug!(container = %name, output = %output.combined(), "container kill reported failure");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(container = %name, error = %err, "container kill failed"),
        }
    });
}
