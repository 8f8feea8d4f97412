#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use run_proxy::config::resolve_config;
use run_proxy::link::{outbox, OutboxReceiver};
use run_proxy::proxy::ProxyContext;
use run_proxy::runs::{ensure_initialized, ensure_runtime, AgentLaunch, RunInit, RuntimeRequest};
use run_proxy::sandbox::{ExecOpts, WORKSPACE_GUEST_ROOT};
use run_proxy::secrets::SecretSet;
use serde_json::{json, Value};

/// A line-oriented ACP agent in plain sh. It appends every request to
/// `agent.log` in its cwd and answers by method; `$1` selects behavior.
/// A prompt whose text is `hold` never gets an answer.
const FAKE_AGENT: &str = r#"
mode="$1"
echo spawn >> spawns.log
while IFS= read -r line; do
  printf '%s\n' "$line" >> agent.log
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":1,"agentCapabilities":{"loadSession":false,"promptCapabilities":{"image":false,"embeddedContext":false}},"authMethods":[{"id":"chatgpt","name":"ChatGPT"}]}}\n' "$id"
      ;;
    *'"method":"authenticate"'*)
      touch authed
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
    *'"method":"session/new"'*)
      if [ "$mode" = auth ] && [ ! -f authed ]; then
        printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"Authentication required"}}\n' "$id"
      else
        printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"sess-%s"}}\n' "$id" "$id"
      fi
      ;;
    *'"method":"session/prompt"'*)
      case "$line" in
        *'"text":"hold"'*)
          ;;
        *'"sessionId":"stale-1"'*)
          printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32602,"message":"Session not found"}}\n' "$id"
          ;;
        *)
          printf '{"jsonrpc":"2.0","id":%s,"result":{"stopReason":"end_turn"}}\n' "$id"
          ;;
      esac
      ;;
    *'"id":'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
  esac
done
"#;

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    ctx: Arc<ProxyContext>,
    inbox: OutboxReceiver,
}

impl Harness {
    fn new(mode: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("runs");
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, FAKE_AGENT).expect("write agent");

        let config = resolve_config(
            json!({
                "orchestrator_url": "ws://127.0.0.1:9/agents",
                "agent_command": ["sh", script.display().to_string(), mode],
                "sandbox": {
                    "provider": "host_process",
                    "workspace_host_root": root.display().to_string(),
                },
            }),
            None,
            |_| None,
        )
        .expect("config");
        let (outbox, inbox) = outbox();
        let ctx = ProxyContext::new(config, "agent-test".to_string(), outbox).expect("context");
        Self {
            _dir: dir,
            root,
            ctx,
            inbox,
        }
    }

    fn workspace(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("run-{run_id}"))
    }

    fn agent_log(&self, run_id: &str) -> Vec<Value> {
        read_lines(&self.workspace(run_id).join("agent.log"))
            .iter()
            .map(|line| serde_json::from_str(line).expect("agent log json"))
            .collect()
    }

    fn methods(&self, run_id: &str) -> Vec<String> {
        self.agent_log(run_id)
            .iter()
            .filter_map(|msg| msg.get("method").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    /// Next outbound message of `kind`, skipping everything else.
    async fn next(&mut self, kind: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let msg = tokio::time::timeout_at(deadline, self.inbox.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
                .expect("outbox open");
            if msg["type"] == json!(kind) {
                return msg;
            }
        }
    }

    /// `count` outbound messages whose type is one of `kinds`, in send order.
    async fn collect(&mut self, kinds: &[&str], count: usize) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut found = Vec::new();
        while found.len() < count {
            let msg = tokio::time::timeout_at(deadline, self.inbox.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {kinds:?}, got {found:?}"))
                .expect("outbox open");
            if kinds.iter().any(|kind| msg["type"] == json!(kind)) {
                found.push(msg);
            }
        }
        found
    }

    async fn wait_for_method(&self, run_id: &str, method: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.methods(run_id).iter().any(|seen| seen == method) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{method} never reached the agent: {:?}",
                self.methods(run_id)
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn text_prompt(text: &str) -> Value {
    json!([{ "type": "text", "text": text }])
}

#[tokio::test]
async fn concurrent_initialize_spawns_once() {
    let harness = Harness::new("basic");
    let req = RuntimeRequest::from_message(&json!({ "run_id": "r1" })).expect("request");
    let run = ensure_runtime(&harness.ctx, &req).await.expect("runtime");

    let init = RunInit::default();
    let env = BTreeMap::new();
    let secrets = SecretSet::new();
    let launch = AgentLaunch {
        init: &init,
        env: &env,
        secrets: &secrets,
    };
    let (first, second) = tokio::join!(
        ensure_initialized(&harness.ctx, &run, Some(launch)),
        ensure_initialized(&harness.ctx, &run, Some(launch)),
    );
    let first = first.expect("first");
    let second = second.expect("second");
    assert_eq!(first, second);
    assert_eq!(first["authMethods"][0]["id"], json!("chatgpt"));

    assert_eq!(read_lines(&harness.workspace("r1").join("spawns.log")).len(), 1);
    assert_eq!(harness.methods("r1"), vec!["initialize".to_string()]);
    assert!(run.is_initialized());
}

#[tokio::test]
async fn prompt_creates_a_session_and_reports_the_result() {
    let mut harness = Harness::new("basic");
    harness.ctx.dispatch(json!({
        "type": "prompt_send",
        "run_id": "r1",
        "prompt_id": "p1",
        "prompt": text_prompt("hello"),
    }));
    let result = harness.next("prompt_result").await;
    assert_eq!(result["ok"], json!(true), "{result}");
    assert_eq!(result["prompt_id"], json!("p1"));
    assert_eq!(result["session_created"], json!(true));
    assert_eq!(result["stop_reason"], json!("end_turn"));
    assert_eq!(
        harness.methods("r1"),
        vec!["initialize", "session/new", "session/prompt"]
    );

    let log = harness.agent_log("r1");
    let new_session = &log[1];
    assert_eq!(
        new_session["params"]["cwd"],
        json!(harness.workspace("r1").display().to_string())
    );
}

#[tokio::test]
async fn auth_required_authenticates_once_and_retries() {
    let mut harness = Harness::new("auth");
    harness.ctx.dispatch(json!({
        "type": "prompt_send",
        "run_id": "r2",
        "prompt_id": "p1",
        "prompt": text_prompt("hello"),
    }));
    let result = harness.next("prompt_result").await;
    assert_eq!(result["ok"], json!(true), "{result}");
    assert_eq!(
        harness.methods("r2"),
        vec![
            "initialize",
            "session/new",
            "authenticate",
            "session/new",
            "session/prompt"
        ]
    );
    let log = harness.agent_log("r2");
    assert_eq!(log[2]["params"], json!({ "methodId": "chatgpt" }));
}

#[tokio::test]
async fn rejected_session_is_recreated_with_context() {
    let mut harness = Harness::new("basic");
    harness.ctx.dispatch(json!({
        "type": "prompt_send",
        "run_id": "r3",
        "prompt_id": "p1",
        "session_id": "stale-1",
        "context": "earlier conversation",
        "prompt": text_prompt("continue"),
    }));
    let result = harness.next("prompt_result").await;
    assert_eq!(result["ok"], json!(true), "{result}");
    assert_eq!(result["session_recreated_from"], json!("stale-1"));
    assert_eq!(result["session_created"], json!(true));
    assert_ne!(result["session_id"], json!("stale-1"));

    let methods = harness.methods("r3");
    assert_eq!(
        methods,
        vec!["initialize", "session/prompt", "session/new", "session/prompt"]
    );
    let replay = &harness.agent_log("r3")[3];
    let blocks = replay["params"]["prompt"].as_array().expect("prompt blocks");
    assert!(blocks.len() >= 2);
    assert!(blocks[0]["text"]
        .as_str()
        .unwrap_or_default()
        .contains("earlier conversation"));
    assert_eq!(blocks.last().expect("user block")["text"], json!("continue"));
}

#[tokio::test]
async fn image_block_is_rejected_before_any_session_call() {
    let mut harness = Harness::new("basic");
    harness.ctx.dispatch(json!({
        "type": "prompt_send",
        "run_id": "r4",
        "prompt_id": "p1",
        "prompt": [{ "type": "image", "data": "aGVsbG8=", "mimeType": "image/png" }],
    }));
    let result = harness.next("prompt_result").await;
    assert_eq!(result["ok"], json!(false));
    assert!(
        result["error"].as_str().unwrap_or_default().contains("image"),
        "{result}"
    );
    assert_eq!(harness.methods("r4"), vec!["initialize".to_string()]);
}

#[tokio::test]
async fn cancel_is_a_notification_with_the_session_id() {
    let mut harness = Harness::new("basic");
    harness.ctx.dispatch(json!({ "type": "acp_open", "run_id": "r5" }));
    let opened = harness.next("acp_opened").await;
    assert_eq!(opened["ok"], json!(true), "{opened}");

    harness.ctx.dispatch(json!({
        "type": "session_cancel",
        "run_id": "r5",
        "control_id": "c1",
        "session_id": "s1",
    }));
    let reply = harness.next("session_control_result").await;
    assert_eq!(reply["ok"], json!(true), "{reply}");
    assert_eq!(reply["control_id"], json!("c1"));

    let expected = json!({ "jsonrpc": "2.0", "method": "session/cancel", "params": { "sessionId": "s1" } });
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let log = harness.agent_log("r5");
        if log.contains(&expected) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "cancel never reached the agent: {log:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn control_for_an_unopened_run_fails_without_spawning() {
    let mut harness = Harness::new("basic");
    harness.ctx.dispatch(json!({
        "type": "session_set_mode",
        "run_id": "nope",
        "control_id": "c2",
        "session_id": "s1",
        "mode_id": "auto",
    }));
    let reply = harness.next("session_control_result").await;
    assert_eq!(reply["ok"], json!(false));
    assert_eq!(reply["error"], json!("run_not_open"));
    assert!(!harness.workspace("nope").exists());
}

#[tokio::test]
async fn close_tears_the_run_down() {
    let mut harness = Harness::new("basic");
    harness.ctx.dispatch(json!({ "type": "acp_open", "run_id": "r6" }));
    assert_eq!(harness.next("acp_opened").await["ok"], json!(true));
    assert!(harness.ctx.runs.get("r6").await.is_some());

    harness.ctx.dispatch(json!({ "type": "acp_close", "run_id": "r6" }));
    let closed = harness.next("acp_closed").await;
    assert_eq!(closed["ok"], json!(true));
    assert!(harness.ctx.runs.get("r6").await.is_none());
}

#[tokio::test]
async fn close_fails_the_in_flight_prompt_without_waiting_for_it() {
    let mut harness = Harness::new("basic");
    harness.ctx.dispatch(json!({
        "type": "prompt_send",
        "run_id": "r7",
        "prompt_id": "p1",
        "timeout_ms": 60_000,
        "prompt": text_prompt("hold"),
    }));
    harness.wait_for_method("r7", "session/prompt").await;
    harness.ctx.dispatch(json!({
        "type": "prompt_send",
        "run_id": "r7",
        "prompt_id": "p2",
        "prompt": text_prompt("queued"),
    }));

    let started = tokio::time::Instant::now();
    harness.ctx.dispatch(json!({ "type": "acp_close", "run_id": "r7" }));
    let replies = harness
        .collect(&["acp_closed", "prompt_result"], 3)
        .await;
    assert!(started.elapsed() < Duration::from_secs(3), "close waited on the prompt");

    let closed = replies
        .iter()
        .find(|msg| msg["type"] == json!("acp_closed"))
        .expect("acp_closed");
    assert_eq!(closed["ok"], json!(true), "{closed}");
    let result_of = |prompt_id: &str| {
        replies
            .iter()
            .find(|msg| msg["prompt_id"] == json!(prompt_id))
            .cloned()
            .unwrap_or_else(|| panic!("no prompt_result for {prompt_id}: {replies:?}"))
    };
    let in_flight = result_of("p1");
    assert_eq!(in_flight["ok"], json!(false), "{in_flight}");
    let queued = result_of("p2");
    assert_eq!(queued["ok"], json!(false), "{queued}");
    assert_eq!(queued["error"], json!("run_closed"));

    // The queued prompt never reached an agent.
    let prompts = harness
        .methods("r7")
        .into_iter()
        .filter(|method| method == "session/prompt")
        .count();
    assert_eq!(prompts, 1);
    assert_eq!(read_lines(&harness.workspace("r7").join("spawns.log")).len(), 1);
    assert!(harness.ctx.runs.get("r7").await.is_none());
}

#[tokio::test]
async fn back_to_back_prompts_run_in_delivery_order() {
    let mut harness = Harness::new("basic");
    let ids = ["p1", "p2", "p3", "p4", "p5"];
    for id in ids {
        harness.ctx.dispatch(json!({
            "type": "prompt_send",
            "run_id": "r8",
            "prompt_id": id,
            "prompt": text_prompt(&format!("text-{id}")),
        }));
    }
    let results = harness.collect(&["prompt_result"], ids.len()).await;
    let order: Vec<&str> = results
        .iter()
        .map(|msg| msg["prompt_id"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(order, ids);
    assert!(results.iter().all(|msg| msg["ok"] == json!(true)), "{results:?}");

    let sent: Vec<String> = harness
        .agent_log("r8")
        .iter()
        .filter(|msg| msg["method"] == json!("session/prompt"))
        .map(|msg| {
            msg["params"]["prompt"][0]["text"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    let expected: Vec<String> = ids.iter().map(|id| format!("text-{id}")).collect();
    assert_eq!(sent, expected);
    assert_eq!(read_lines(&harness.workspace("r8").join("spawns.log")).len(), 1);
}

#[tokio::test]
async fn exec_outside_the_workspace_is_refused_before_spawning() {
    let mut harness = Harness::new("basic");
    harness.ctx.dispatch(json!({ "type": "acp_open", "run_id": "r9" }));
    assert_eq!(harness.next("acp_opened").await["ok"], json!(true));
    let run = harness.ctx.runs.get("r9").await.expect("open run");

    let marker = harness.root.join("exec-ran");
    let exec = |cwd: &str| ExecOpts {
        instance_name: run.instance_name.clone(),
        command: vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("touch '{}'", marker.display()),
        ],
        cwd_in_guest: cwd.to_string(),
        env: BTreeMap::new(),
    };

    for cwd in ["/etc", "/workspace/../../etc"] {
        let err = harness
            .ctx
            .sandbox
            .exec_process(&exec(cwd))
            .await
            .expect_err("cwd outside the workspace");
        assert_eq!(err.to_string(), "cwd outside workspace");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!marker.exists(), "a refused exec must not run anything");

    let handle = harness
        .ctx
        .sandbox
        .exec_process(&exec(WORKSPACE_GUEST_ROOT))
        .await
        .expect("exec inside the workspace");
    assert_eq!(handle.wait().await.code, Some(0));
    assert!(marker.exists());
}

#[tokio::test]
async fn removing_the_sandbox_refuses_prompts_queued_behind_it() {
    let mut harness = Harness::new("basic");
    harness.ctx.dispatch(json!({
        "type": "prompt_send",
        "run_id": "r10",
        "prompt_id": "p1",
        "prompt": text_prompt("hold"),
    }));
    harness.wait_for_method("r10", "session/prompt").await;
    let instance_name = harness.ctx.runs.get("r10").await.expect("run").instance_name.clone();
    harness.ctx.dispatch(json!({
        "type": "prompt_send",
        "run_id": "r10",
        "prompt_id": "p2",
        "prompt": text_prompt("queued"),
    }));
    harness.ctx.dispatch(json!({
        "type": "sandbox_control",
        "action": "remove",
        "run_id": "r10",
        "instance_name": instance_name,
    }));

    let replies = harness
        .collect(&["sandbox_control_result", "prompt_result"], 3)
        .await;
    let removed = replies
        .iter()
        .find(|msg| msg["type"] == json!("sandbox_control_result"))
        .expect("sandbox_control_result");
    assert_eq!(removed["ok"], json!(true), "{removed}");
    let queued = replies
        .iter()
        .find(|msg| msg["prompt_id"] == json!("p2"))
        .expect("p2 result");
    assert_eq!(queued["error"], json!("run_closed"), "{queued}");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(read_lines(&harness.workspace("r10").join("spawns.log")).len(), 1);
    assert!(harness.ctx.runs.get("r10").await.is_none());
}
