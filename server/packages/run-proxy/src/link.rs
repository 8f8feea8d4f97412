//! Persistent websocket link to the orchestrator.
//!
//! The link reconnects forever with exponential backoff. Outbound messages
//! go through an [`Outbox`]; anything queued while disconnected is delivered
//! after the next successful connect, behind the handler's greeting messages.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid orchestrator url: {0}")]
    Url(String),
    #[error("invalid auth token header: {0}")]
    Header(String),
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Cloneable handle for queueing messages to the orchestrator.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Value>,
}

pub type OutboxReceiver = mpsc::UnboundedReceiver<Value>;

pub fn outbox() -> (Outbox, OutboxReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Outbox { tx }, rx)
}

impl Outbox {
    pub fn send(&self, message: Value) {
        if self.tx.send(message).is_err() {
            tracing::debug!("outbox closed; dropping message");
        }
    }
}

// ---------------------------------------------------------------------------
// Link loop
// ---------------------------------------------------------------------------

pub trait LinkHandler: Send + Sync + 'static {
    /// Messages written first on a fresh connection, before the outbox drains.
    fn on_connected(&self, generation: u64) -> BoxFuture<'static, Vec<Value>>;

    /// Inbound object with a string `type`.
    fn on_message(&self, message: Value);

    fn on_disconnected(&self, generation: u64);

    fn heartbeat(&self) -> Value;
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub url: String,
    pub auth_token: Option<String>,
    pub heartbeat_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl LinkOptions {
    pub fn new(url: impl Into<String>, auth_token: Option<String>, heartbeat_interval: Duration) -> Self {
        Self {
            url: url.into(),
            auth_token,
            heartbeat_interval,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

enum ConnectionEnd {
    Disconnected,
    Shutdown,
}

/// Runs until `shutdown` flips to `true` (or its sender is dropped).
pub async fn run_link(
    options: LinkOptions,
    handler: Arc<dyn LinkHandler>,
    mut outbox: OutboxReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = options.initial_backoff;
    let mut generation: u64 = 0;
    let mut carry: Option<Value> = None;

    loop {
        if *shutdown.borrow() {
            return;
        }
        match connect(&options).await {
            Ok(socket) => {
                generation += 1;
                backoff = options.initial_backoff;
                tracing::info!(url = %options.url, generation, "connected to orchestrator");
                let end = serve_connection(
                    socket,
                    generation,
                    &options,
                    handler.as_ref(),
                    &mut outbox,
                    &mut shutdown,
                    &mut carry,
                )
                .await;
                handler.on_disconnected(generation);
                match end {
                    ConnectionEnd::Shutdown => {
                        tracing::info!(generation, "orchestrator link shut down");
                        return;
                    }
                    ConnectionEnd::Disconnected => {
                        tracing::warn!(generation, "orchestrator connection lost");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(url = %options.url, error = %err, backoff_ms = backoff.as_millis() as u64, "orchestrator connect failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return,
        }
        backoff = next_backoff(backoff, options.max_backoff);
    }
}

pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

async fn connect(options: &LinkOptions) -> Result<Socket, LinkError> {
    let mut request = options
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| LinkError::Url(err.to_string()))?;
    if let Some(token) = options.auth_token.as_deref().filter(|token| !token.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| LinkError::Header(err.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (socket, _response) = connect_async(request).await?;
    Ok(socket)
}

async fn serve_connection(
    socket: Socket,
    generation: u64,
    options: &LinkOptions,
    handler: &dyn LinkHandler,
    outbox: &mut OutboxReceiver,
    shutdown: &mut watch::Receiver<bool>,
    carry: &mut Option<Value>,
) -> ConnectionEnd {
    let (mut write, mut read) = socket.split();

    for message in handler.on_connected(generation).await {
        if let Err(err) = write.send(encode(&message)).await {
            tracing::warn!(error = %err, "failed to send greeting");
            return ConnectionEnd::Disconnected;
        }
    }
    if let Some(message) = carry.take() {
        if let Err(err) = write.send(encode(&message)).await {
            tracing::warn!(error = %err, "failed to resend carried message");
            *carry = Some(message);
            return ConnectionEnd::Disconnected;
        }
    }

    let period = options.heartbeat_interval.max(Duration::from_millis(10));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
            }
            _ = heartbeat.tick() => {
                if let Err(err) = write.send(encode(&handler.heartbeat())).await {
                    tracing::warn!(error = %err, "heartbeat send failed");
                    return ConnectionEnd::Disconnected;
                }
            }
            next = outbox.recv() => {
                let Some(message) = next else {
                    return ConnectionEnd::Shutdown;
                };
                if let Err(err) = write.send(encode(&message)).await {
                    tracing::warn!(error = %err, "outbound send failed");
                    *carry = Some(message);
                    return ConnectionEnd::Disconnected;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => dispatch_inbound(handler, text.as_bytes()),
                Some(Ok(Message::Binary(bytes))) => dispatch_inbound(handler, &bytes),
                Some(Ok(Message::Ping(payload))) => {
                    if write.send(Message::Pong(payload)).await.is_err() {
                        return ConnectionEnd::Disconnected;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "orchestrator read failed");
                    return ConnectionEnd::Disconnected;
                }
            },
        }
    }
}

fn encode(message: &Value) -> Message {
    Message::Text(message.to_string().into())
}

fn dispatch_inbound(handler: &dyn LinkHandler, raw: &[u8]) {
    match parse_inbound(raw) {
        Some(message) => handler.on_message(message),
        None => tracing::debug!(bytes = raw.len(), "ignoring inbound frame without a type"),
    }
}

/// Keeps only JSON objects that carry a string `type`.
pub fn parse_inbound(raw: &[u8]) -> Option<Value> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    value.get("type").and_then(Value::as_str)?;
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frames_need_an_object_type() {
        assert!(parse_inbound(br#"{"type":"prompt_send","run_id":"r1"}"#).is_some());
        assert!(parse_inbound(br#"{"type":1}"#).is_none());
        assert!(parse_inbound(br#"[1,2]"#).is_none());
        assert!(parse_inbound(b"not json").is_none());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut delay = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay, MAX_BACKOFF);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }
}
