use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use acp_stdio_bridge::{
    AgentBridge, BridgeError, BridgeHandler, BridgeOptions, ExitInfo, ProcessHandle, RpcError,
    StderrPhase, INIT_MARKER_PREFIX,
};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::watch;

#[derive(Default)]
struct RecordingHandler {
    notifications: StdMutex<Vec<(String, Value)>>,
    stderr: StdMutex<Vec<(String, StderrPhase)>>,
}

impl BridgeHandler for RecordingHandler {
    fn on_request(&self, _id: &Value, method: String, params: Value) -> BoxFuture<'static, Result<Value, RpcError>> {
        Box::pin(async move {
            match method.as_str() {
                "echo" => Ok(json!({ "echo": params })),
                _ => Err(RpcError::method_not_found(&method)),
            }
        })
    }

    fn on_notification(&self, method: String, params: Value) {
        self.notifications
            .lock()
            .expect("notifications lock")
            .push((method, params));
    }

    fn on_stderr(&self, line: &str, phase: StderrPhase) {
        self.stderr
            .lock()
            .expect("stderr lock")
            .push((line.to_string(), phase));
    }
}

struct FakeAgent {
    requests: Lines<BufReader<DuplexStream>>,
    stdout: DuplexStream,
    stderr: DuplexStream,
    exit: watch::Sender<Option<ExitInfo>>,
}

impl FakeAgent {
    async fn next_message(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.requests.next_line())
            .await
            .expect("agent read timeout")
            .expect("agent read")
            .expect("agent stdin open");
        serde_json::from_str(&line).expect("agent received json")
    }

    async fn send(&mut self, payload: Value) {
        let mut line = serde_json::to_vec(&payload).expect("serialize");
        line.push(b'\n');
        self.stdout.write_all(&line).await.expect("write stdout");
        self.stdout.flush().await.expect("flush stdout");
    }

    async fn send_stderr(&mut self, line: &str) {
        self.stderr
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write stderr");
        self.stderr.flush().await.expect("flush stderr");
    }
}

fn start(options: BridgeOptions) -> (Arc<AgentBridge>, FakeAgent, Arc<RecordingHandler>) {
    let (bridge_stdin, agent_stdin) = tokio::io::duplex(64 * 1024);
    let (agent_stdout, bridge_stdout) = tokio::io::duplex(64 * 1024);
    let (agent_stderr, bridge_stderr) = tokio::io::duplex(64 * 1024);
    let (exit_tx, exit_rx) = watch::channel(None);

    let process = ProcessHandle::from_streams(
        Box::pin(bridge_stdin),
        Box::pin(bridge_stdout),
        Some(Box::pin(bridge_stderr)),
        exit_rx,
    );
    let handler = Arc::new(RecordingHandler::default());
    let bridge = AgentBridge::start(process, options, handler.clone()).expect("bridge start");
    let agent = FakeAgent {
        requests: BufReader::new(agent_stdin).lines(),
        stdout: agent_stdout,
        stderr: agent_stderr,
        exit: exit_tx,
    };
    (bridge, agent, handler)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn requests_use_increasing_ids_and_resolve_by_id() {
    let (bridge, mut agent, _) = start(BridgeOptions::default());

    let first = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.send_rpc("initialize", json!({"v": 1}), None).await })
    };
    let request = agent.next_message().await;
    assert_eq!(request["jsonrpc"], "2.0");
    assert_eq!(request["id"], 1);
    assert_eq!(request["method"], "initialize");
    assert_eq!(request["params"], json!({"v": 1}));

    let second = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.send_rpc("session/new", json!({}), None).await })
    };
    let request = agent.next_message().await;
    assert_eq!(request["id"], 2);

    agent.send(json!({"jsonrpc":"2.0","id":2,"result":{"sessionId":"s-1"}})).await;
    agent.send(json!({"jsonrpc":"2.0","id":1,"result":{"protocolVersion":1}})).await;

    let second = second.await.expect("join").expect("second ok");
    let first = first.await.expect("join").expect("first ok");
    assert_eq!(second["sessionId"], "s-1");
    assert_eq!(first["protocolVersion"], 1);
    assert_eq!(bridge.pending_count().await, 0);
}

#[tokio::test]
async fn timeout_drops_the_pending_entry_and_ignores_late_replies() {
    let (bridge, mut agent, _) = start(BridgeOptions::default());

    let err = {
        let bridge = bridge.clone();
        let call = tokio::spawn(async move {
            bridge
                .send_rpc("session/prompt", json!({}), Some(Duration::from_millis(50)))
                .await
        });
        let _ = agent.next_message().await;
        call.await.expect("join").expect_err("timeout")
    };
    assert!(matches!(err, BridgeError::Timeout { ref method, timeout_ms: 50 } if method == "session/prompt"));
    assert_eq!(err.to_string(), "rpc timeout after 50ms: session/prompt");
    assert_eq!(bridge.pending_count().await, 0);

    agent.send(json!({"jsonrpc":"2.0","id":1,"result":{}})).await;

    let next = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.send_rpc("ping", json!({}), None).await })
    };
    let request = agent.next_message().await;
    assert_eq!(request["id"], 2);
    agent.send(json!({"jsonrpc":"2.0","id":2,"result":"pong"})).await;
    assert_eq!(next.await.expect("join").expect("ok"), json!("pong"));
}

#[tokio::test]
async fn remote_errors_keep_code_and_message() {
    let (bridge, mut agent, _) = start(BridgeOptions::default());
    let call = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.send_rpc("session/prompt", json!({}), None).await })
    };
    let _ = agent.next_message().await;
    agent
        .send(json!({"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"Authentication required"}}))
        .await;

    match call.await.expect("join") {
        Err(BridgeError::Remote(err)) => {
            assert_eq!(err.code, -32000);
            assert_eq!(err.message, "Authentication required");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn close_fails_pending_and_rejects_new_requests() {
    let (bridge, mut agent, _) = start(BridgeOptions::default());
    let call = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.send_rpc("session/prompt", json!({}), None).await })
    };
    let _ = agent.next_message().await;

    bridge.close().await;
    bridge.close().await;

    assert!(matches!(call.await.expect("join"), Err(BridgeError::Closed)));
    assert!(bridge.is_closed());
    assert!(matches!(
        bridge.send_rpc("ping", json!({}), None).await,
        Err(BridgeError::NotConnected)
    ));
    assert!(matches!(
        bridge.send_notification("session/cancel", json!({})).await,
        Err(BridgeError::NotConnected)
    ));
}

#[tokio::test]
async fn stdout_eof_fails_pending_requests() {
    let (bridge, mut agent, _) = start(BridgeOptions::default());
    let call = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.send_rpc("session/prompt", json!({}), None).await })
    };
    let _ = agent.next_message().await;
    drop(agent);

    assert!(matches!(call.await.expect("join"), Err(BridgeError::Closed)));
}

#[tokio::test]
async fn init_marker_is_consumed_once_and_later_lines_are_forwarded() {
    let options = BridgeOptions {
        init_marker: Some(INIT_MARKER_PREFIX.to_string()),
        ..BridgeOptions::default()
    };
    let (bridge, mut agent, handler) = start(options);
    assert!(bridge.init_pending());

    agent.send_stderr("[init] preparing").await;
    agent
        .send_stderr(&format!("{INIT_MARKER_PREFIX}{{\"ok\":true,\"exitCode\":0}}"))
        .await;
    agent
        .send_stderr(&format!("{INIT_MARKER_PREFIX}{{\"ok\":false}}"))
        .await;

    let outcome = bridge
        .wait_for_init_result(Duration::from_secs(5))
        .await
        .expect("init outcome");
    assert!(outcome.ok);
    assert_eq!(outcome.exit_code, Some(0));

    eventually(|| handler.stderr.lock().expect("lock").len() >= 2).await;
    let lines = handler.stderr.lock().expect("lock").clone();
    assert_eq!(lines[0], ("[init] preparing".to_string(), StderrPhase::Init));
    assert_eq!(lines[1].1, StderrPhase::Agent);
    assert!(lines[1].0.starts_with(INIT_MARKER_PREFIX));

    let again = bridge
        .wait_for_init_result(Duration::from_millis(10))
        .await
        .expect("cached outcome");
    assert!(again.ok);
}

#[tokio::test]
async fn init_wait_without_marker_is_immediately_ok() {
    let (bridge, _agent, _) = start(BridgeOptions::default());
    let outcome = bridge
        .wait_for_init_result(Duration::from_millis(10))
        .await
        .expect("no marker requested");
    assert!(outcome.ok);
}

#[tokio::test]
async fn init_wait_times_out_without_marker_line() {
    let options = BridgeOptions {
        init_marker: Some(INIT_MARKER_PREFIX.to_string()),
        ..BridgeOptions::default()
    };
    let (bridge, _agent, _) = start(options);
    let err = bridge
        .wait_for_init_result(Duration::from_millis(30))
        .await
        .expect_err("timeout");
    assert_eq!(err.to_string(), "init timeout after 30ms");
}

#[tokio::test]
async fn exit_before_marker_fails_init_wait() {
    let options = BridgeOptions {
        init_marker: Some(INIT_MARKER_PREFIX.to_string()),
        ..BridgeOptions::default()
    };
    let (bridge, agent, _) = start(options);
    let FakeAgent { exit, .. } = agent;
    exit.send(Some(ExitInfo {
        code: Some(2),
        signal: None,
    }))
    .expect("send exit");

    let err = bridge
        .wait_for_init_result(Duration::from_secs(5))
        .await
        .expect_err("exited");
    assert!(matches!(
        err,
        BridgeError::ExitedBeforeInit {
            code: Some(2),
            signal: None
        }
    ));
    eventually(|| bridge.is_closed()).await;
}

#[tokio::test]
async fn malformed_marker_reports_parse_failure() {
    let options = BridgeOptions {
        init_marker: Some(INIT_MARKER_PREFIX.to_string()),
        ..BridgeOptions::default()
    };
    let (bridge, mut agent, _) = start(options);
    agent
        .send_stderr(&format!("{INIT_MARKER_PREFIX}not-json"))
        .await;
    let err = bridge
        .wait_for_init_result(Duration::from_secs(5))
        .await
        .expect_err("parse failure");
    assert!(matches!(err, BridgeError::InitMarkerParse(_)));
}

#[tokio::test]
async fn agent_notifications_and_requests_reach_the_handler() {
    let (_bridge, mut agent, handler) = start(BridgeOptions::default());

    agent
        .send(json!({"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"s-1"}}))
        .await;
    agent
        .send(json!({"jsonrpc":"2.0","id":"req-1","method":"echo","params":{"a":1}}))
        .await;
    agent
        .send(json!({"jsonrpc":"2.0","id":7,"method":"terminal/create","params":{}}))
        .await;

    let first = agent.next_message().await;
    let second = agent.next_message().await;
    let (echo, missing) = if first["id"] == "req-1" {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(echo["result"], json!({"echo": {"a": 1}}));
    assert_eq!(missing["id"], 7);
    assert_eq!(missing["error"]["code"], -32601);

    let notifications = handler.notifications.lock().expect("lock").clone();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].0, "session/update");
    assert_eq!(notifications[0].1["sessionId"], "s-1");
}

#[tokio::test]
async fn notifications_carry_no_id() {
    let (bridge, mut agent, _) = start(BridgeOptions::default());
    bridge
        .send_notification("session/cancel", json!({"sessionId":"s-1"}))
        .await
        .expect("notify");
    let message = agent.next_message().await;
    assert_eq!(message["method"], "session/cancel");
    assert!(message.get("id").is_none());
    assert_eq!(bridge.pending_count().await, 0);
}

#[tokio::test]
async fn stderr_lines_are_redacted_before_forwarding() {
    let options = BridgeOptions {
        redact: Some(Arc::new(|line: &str| line.replace("hunter22", "***"))),
        ..BridgeOptions::default()
    };
    let (_bridge, mut agent, handler) = start(options);
    agent.send_stderr("token=hunter22").await;
    eventually(|| !handler.stderr.lock().expect("lock").is_empty()).await;
    let lines = handler.stderr.lock().expect("lock").clone();
    assert_eq!(lines[0], ("token=***".to_string(), StderrPhase::Agent));
}
