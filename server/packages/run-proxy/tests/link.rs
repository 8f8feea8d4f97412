use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use run_proxy::link::{outbox, run_link, LinkHandler, LinkOptions};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

#[derive(Debug, PartialEq)]
enum Event {
    Connected(u64),
    Message(Value),
    Disconnected(u64),
}

struct Recorder {
    events: mpsc::UnboundedSender<Event>,
}

impl LinkHandler for Recorder {
    fn on_connected(&self, generation: u64) -> BoxFuture<'static, Vec<Value>> {
        let _ = self.events.send(Event::Connected(generation));
        Box::pin(async move { vec![json!({ "type": "register_agent", "generation": generation })] })
    }

    fn on_message(&self, message: Value) {
        let _ = self.events.send(Event::Message(message));
    }

    fn on_disconnected(&self, generation: u64) {
        let _ = self.events.send(Event::Disconnected(generation));
    }

    fn heartbeat(&self) -> Value {
        json!({ "type": "heartbeat" })
    }
}

async fn accept(listener: &TcpListener) -> (WebSocketStream<TcpStream>, Option<String>) {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timeout")
        .expect("accept");
    let mut authorization = None;
    let socket = accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        authorization = req
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    })
    .await
    .expect("handshake");
    (socket, authorization)
}

async fn next_json(socket: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame timeout")
            .expect("socket open")
            .expect("frame");
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).expect("json frame");
            if value["type"] != json!("heartbeat") {
                return value;
            }
        }
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event timeout")
        .expect("events open")
}

#[tokio::test]
async fn link_greets_drains_filters_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let (tx, mut events) = mpsc::unbounded_channel();
    let (outbox, outbox_rx) = outbox();
    outbox.send(json!({ "type": "queued_while_offline" }));

    let mut options = LinkOptions::new(
        format!("ws://{addr}/agents"),
        Some("tok-123".to_string()),
        Duration::from_secs(30),
    );
    options.initial_backoff = Duration::from_millis(50);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let link = tokio::spawn(run_link(
        options,
        Arc::new(Recorder { events: tx }),
        outbox_rx,
        shutdown_rx,
    ));

    let (mut socket, authorization) = accept(&listener).await;
    assert_eq!(authorization.as_deref(), Some("Bearer tok-123"));
    assert_eq!(next_event(&mut events).await, Event::Connected(1));
    assert_eq!(
        next_json(&mut socket).await,
        json!({ "type": "register_agent", "generation": 1 })
    );
    assert_eq!(next_json(&mut socket).await, json!({ "type": "queued_while_offline" }));

    for frame in [
        r#"{"type":"prompt_send","run_id":"r1"}"#,
        "not json",
        r#"{"run_id":"r1"}"#,
        r#"{"type":7}"#,
        r#"{"type":"acp_close","run_id":"r1"}"#,
    ] {
        socket.send(Message::Text(frame.to_string())).await.expect("send");
    }
    assert_eq!(
        next_event(&mut events).await,
        Event::Message(json!({ "type": "prompt_send", "run_id": "r1" }))
    );
    assert_eq!(
        next_event(&mut events).await,
        Event::Message(json!({ "type": "acp_close", "run_id": "r1" }))
    );

    outbox.send(json!({ "type": "prompt_result", "ok": true }));
    assert_eq!(next_json(&mut socket).await, json!({ "type": "prompt_result", "ok": true }));

    socket.close(None).await.expect("close");
    drop(socket);
    assert_eq!(next_event(&mut events).await, Event::Disconnected(1));

    let (mut socket, _) = accept(&listener).await;
    assert_eq!(next_event(&mut events).await, Event::Connected(2));
    assert_eq!(
        next_json(&mut socket).await,
        json!({ "type": "register_agent", "generation": 2 })
    );

    shutdown_tx.send(true).expect("shutdown");
    tokio::time::timeout(Duration::from_secs(5), link)
        .await
        .expect("link stops")
        .expect("link task");
    assert_eq!(next_event(&mut events).await, Event::Disconnected(2));
}

#[tokio::test]
async fn link_without_token_sends_no_authorization() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, _events) = mpsc::unbounded_channel();
    let (_outbox, outbox_rx) = outbox();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let link = tokio::spawn(run_link(
        LinkOptions::new(format!("ws://{addr}/agents"), None, Duration::from_secs(30)),
        Arc::new(Recorder { events: tx }),
        outbox_rx,
        shutdown_rx,
    ));

    let (_socket, authorization) = accept(&listener).await;
    assert_eq!(authorization, None);

    shutdown_tx.send(true).expect("shutdown");
    tokio::time::timeout(Duration::from_secs(5), link)
        .await
        .expect("link stops")
        .expect("link task");
}
