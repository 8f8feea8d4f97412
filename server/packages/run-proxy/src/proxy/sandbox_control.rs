use std::collections::BTreeSet;
use std::sync::Arc;

use run_proxy_error::RuntimeError;
use serde_json::{json, Value};

use crate::runs::{close_agent, Run};
use crate::sandbox::{now_rfc3339, EnsureRunningOpts, InstanceInfo, InstanceStatus, WORKSPACE_GUEST_ROOT};
use crate::validate::{non_empty_str, validate_instance_name, validate_run_id};

use super::ProxyContext;

/// Prefix of instance names the proxy derives from run ids.
const RUN_INSTANCE_PREFIX: &str = "run-proxy-run-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxAction {
    Inspect,
    EnsureRunning,
    Stop,
    Remove,
    ReportInventory,
}

impl SandboxAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "inspect" => Some(Self::Inspect),
            "ensure_running" => Some(Self::EnsureRunning),
            "stop" => Some(Self::Stop),
            "remove" => Some(Self::Remove),
            "report_inventory" => Some(Self::ReportInventory),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct ControlOutcome {
    status: Option<InstanceStatus>,
    details: Option<Value>,
}

pub(super) fn dispatch(ctx: &Arc<ProxyContext>, msg: Value) {
    let run_id = non_empty_str(msg.get("run_id")).map(str::to_string);
    let instance_name = non_empty_str(msg.get("instance_name")).map(str::to_string);
    let action = non_empty_str(msg.get("action")).unwrap_or_default().to_string();
    let reply = json!({
        "type": "sandbox_control_result",
        "run_id": run_id,
        "instance_name": instance_name,
        "action": action,
    });

    let task_ctx = ctx.clone();
    let task_reply = reply.clone();
    ctx.spawn_control(reply, async move {
        let ctx = task_ctx;
        let result = match SandboxAction::parse(&action) {
            Some(parsed) => run_action(&ctx, parsed, run_id.as_deref(), instance_name.as_deref(), &msg).await,
            None => Err(RuntimeError::invalid("unsupported_action")),
        };
        let mut reply = task_reply;
        match result {
            Ok(outcome) => {
                reply["ok"] = json!(true);
                if let Some(status) = outcome.status {
                    reply["status"] = json!(status);
                }
                if let Some(details) = outcome.details {
                    reply["details"] = details;
                }
            }
            Err(err) => {
                let message = ctx.secrets.redact(&err.to_string());
                tracing::warn!(action = %action, run_id = ?run_id, error = %message, "sandbox control failed");
                if let (Some(run_id), Some(instance_name)) = (&run_id, &instance_name) {
                    ctx.send_instance_status(run_id, instance_name, InstanceStatus::Error, Some(&message));
                }
                reply["ok"] = json!(false);
                reply["error"] = json!(message);
            }
        }
        reply
    });
}

async fn run_action(
    ctx: &Arc<ProxyContext>,
    action: SandboxAction,
    run_id: Option<&str>,
    instance_name: Option<&str>,
    msg: &Value,
) -> Result<ControlOutcome, RuntimeError> {
    if action == SandboxAction::ReportInventory {
        let expected = expected_instances(msg.get("expected_instances"));
        ctx.send(inventory_message(ctx, expected.as_ref()).await?);
        return Ok(ControlOutcome::default());
    }

    let instance_name = validate_instance_name(instance_name.unwrap_or_default())?;
    let report = |status: InstanceStatus| {
        if let Some(run_id) = run_id {
            ctx.send_instance_status(run_id, &instance_name, status, None);
        }
    };

    match action {
        SandboxAction::Inspect => {
            let info = ctx.sandbox.inspect_instance(&instance_name).await?;
            report(info.status);
            Ok(outcome_of(&info))
        }
        SandboxAction::EnsureRunning => {
            let run_id = validate_run_id(run_id.map(Value::from).as_ref())?;
            let mounts = match ctx.runs.get(&run_id).await.and_then(|run| run.workspace()) {
                Some(workspace) => workspace.mounts,
                None => Vec::new(),
            };
            let info = ctx
                .sandbox
                .ensure_instance_running(&EnsureRunningOpts {
                    run_id: run_id.clone(),
                    instance_name: instance_name.clone(),
                    workspace_guest_path: WORKSPACE_GUEST_ROOT.to_string(),
                    env: Default::default(),
                    mounts,
                })
                .await?;
            ctx.send_instance_status(&run_id, &instance_name, info.status, None);
            Ok(outcome_of(&info))
        }
        SandboxAction::Stop => {
            if let Some(run) = run_for(ctx, run_id, &instance_name).await {
                close_agent(&run, "sandbox_control_stop").await;
            }
            ctx.sandbox.stop_instance(&instance_name).await?;
            let info = ctx.sandbox.inspect_instance(&instance_name).await?;
            report(info.status);
            Ok(ControlOutcome {
                status: Some(info.status),
                details: None,
            })
        }
        SandboxAction::Remove => {
            if let Some(run) = run_for(ctx, run_id, &instance_name).await {
                // Work already queued for the Run must not bring it back.
                ctx.lanes.close(&run.run_id);
                run.mark_closed();
                close_agent(&run, "sandbox_control_remove").await;
                ctx.runs.remove(&run).await;
            }
            ctx.sandbox.remove_instance(&instance_name).await?;
            report(InstanceStatus::Missing);
            Ok(ControlOutcome {
                status: Some(InstanceStatus::Missing),
                details: None,
            })
        }
        SandboxAction::ReportInventory => Ok(ControlOutcome::default()),
    }
}

async fn run_for(ctx: &ProxyContext, run_id: Option<&str>, instance_name: &str) -> Option<Arc<Run>> {
    match run_id {
        Some(run_id) => ctx.runs.get(run_id).await,
        None => ctx.runs.find_by_instance(instance_name).await,
    }
}

fn outcome_of(info: &InstanceInfo) -> ControlOutcome {
    ControlOutcome {
        status: Some(info.status),
        details: Some(json!({ "created_at": info.created_at })),
    }
}

fn expected_instances(raw: Option<&Value>) -> Option<BTreeSet<String>> {
    let names = raw?.as_array()?;
    Some(
        names
            .iter()
            .filter_map(|entry| match entry {
                Value::String(name) => Some(name.trim().to_string()),
                Value::Object(object) => object
                    .get("instance_name")
                    .and_then(Value::as_str)
                    .map(|name| name.trim().to_string()),
                _ => None,
            })
            .filter(|name| !name.is_empty())
            .collect(),
    )
}

fn run_id_of(instance_name: &str) -> Option<&str> {
    instance_name
        .strip_prefix(RUN_INSTANCE_PREFIX)
        .filter(|run_id| !run_id.is_empty())
}

/// `sandbox_inventory` for the provider's managed instances. Names listed in
/// `expected` but not found come back as `missing_instances`.
pub async fn inventory_message(
    ctx: &ProxyContext,
    expected: Option<&BTreeSet<String>>,
) -> Result<Value, RuntimeError> {
    let captured_at = now_rfc3339();
    let instances = ctx.sandbox.list_instances(true).await?;
    Ok(build_inventory(
        ctx.sandbox.name(),
        ctx.sandbox.runtime(),
        &captured_at,
        &instances,
        expected,
    ))
}

pub(crate) fn build_inventory(
    provider: &str,
    runtime: Option<&str>,
    captured_at: &str,
    instances: &[InstanceInfo],
    expected: Option<&BTreeSet<String>>,
) -> Value {
    let listed: Vec<Value> = instances
        .iter()
        .map(|info| {
            json!({
                "instance_name": info.instance_name,
                "run_id": run_id_of(&info.instance_name),
                "status": info.status,
                "created_at": info.created_at,
                "last_seen_at": captured_at,
            })
        })
        .collect();
    let mut inventory = json!({
        "type": "sandbox_inventory",
        "inventory_id": uuid::Uuid::new_v4().to_string(),
        "provider": provider,
        "runtime": runtime,
        "captured_at": captured_at,
        "instances": listed,
    });
    if let Some(expected) = expected {
        let found: BTreeSet<&str> = instances.iter().map(|info| info.instance_name.as_str()).collect();
        let missing: Vec<Value> = expected
            .iter()
            .filter(|name| !found.contains(name.as_str()))
            .map(|name| json!({ "instance_name": name, "run_id": run_id_of(name) }))
            .collect();
        inventory["missing_instances"] = json!(missing);
    }
    inventory
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, status: InstanceStatus) -> InstanceInfo {
        InstanceInfo {
            instance_name: name.to_string(),
            status,
            created_at: Some("2026-01-01T00:00:00.000Z".to_string()),
        }
    }

    #[test]
    fn actions_parse() {
        assert_eq!(SandboxAction::parse("ensure_running"), Some(SandboxAction::EnsureRunning));
        assert_eq!(SandboxAction::parse(" remove "), Some(SandboxAction::Remove));
        assert_eq!(SandboxAction::parse("reboot"), None);
    }

    #[test]
    fn inventory_lists_instances_and_missing_ones() {
        let expected: BTreeSet<String> = ["run-proxy-run-a", "run-proxy-run-gone"]
            .iter()
            .map(|name| name.to_string())
            .collect();
        let inventory = build_inventory(
            "container_oci",
            Some("docker"),
            "2026-01-02T00:00:00.000Z",
            &[info("run-proxy-run-a", InstanceStatus::Running), info("custom", InstanceStatus::Stopped)],
            Some(&expected),
        );
        assert_eq!(inventory["type"], json!("sandbox_inventory"));
        assert_eq!(inventory["runtime"], json!("docker"));
        assert_eq!(inventory["instances"][0]["run_id"], json!("a"));
        assert_eq!(inventory["instances"][0]["status"], json!("running"));
        assert_eq!(inventory["instances"][1]["run_id"], Value::Null);
        assert_eq!(
            inventory["missing_instances"],
            json!([{ "instance_name": "run-proxy-run-gone", "run_id": "gone" }])
        );
        assert!(uuid::Uuid::parse_str(inventory["inventory_id"].as_str().unwrap_or_default()).is_ok());

        let without = build_inventory("host_process", None, "t", &[], None);
        assert!(without.get("missing_instances").is_none());
    }

    #[test]
    fn expected_instances_accept_names_or_objects() {
        let expected = expected_instances(Some(&json!(["a", { "instance_name": "b" }, 3, ""]))).expect("set");
        assert_eq!(expected.into_iter().collect::<Vec<_>>(), vec!["a".to_string(), "b".to_string()]);
        assert!(expected_instances(None).is_none());
    }
}
