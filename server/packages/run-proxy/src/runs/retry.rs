use std::future::Future;
use std::sync::Arc;

use acp_stdio_bridge::{AgentBridge, BridgeError};
use run_proxy_error::{ErrorType, RuntimeError};
use serde_json::{json, Value};

use crate::validate::auth_timeout_from_env;

use super::Run;

/// Remote code agents use for "authenticate first".
pub const AUTH_REQUIRED_CODE: i64 = -32000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    AuthExpired,
    SessionInvalid,
    Other,
}

/// The only place the auth and session heuristics live.
pub fn classify_error(err: &RuntimeError) -> ErrorClass {
    let error_type = err.error_type();
    // A timed-out call names its method, which must not read as a session hint.
    if error_type.is_validation() || error_type == ErrorType::Timeout {
        return ErrorClass::Other;
    }
    if err.remote_code() == Some(AUTH_REQUIRED_CODE) {
        return ErrorClass::AuthExpired;
    }
    let message = err.to_string().to_lowercase();
    if message.contains("authentication required") || message.contains("auth expired") {
        return ErrorClass::AuthExpired;
    }
    if message.contains("session") {
        return ErrorClass::SessionInvalid;
    }
    ErrorClass::Other
}

pub fn map_bridge_error(err: BridgeError) -> RuntimeError {
    match err {
        BridgeError::NotConnected => RuntimeError::AgentNotConnected,
        BridgeError::Remote(rpc) => RuntimeError::Remote {
            code: rpc.code,
            message: rpc.message,
            data: rpc.data,
        },
        BridgeError::Timeout { .. } | BridgeError::InitTimeout { .. } => RuntimeError::Timeout {
            message: err.to_string(),
        },
        BridgeError::ExitedBeforeInit { code, signal } => {
            RuntimeError::AgentProcessExited { code, signal }
        }
        BridgeError::InitMarkerParse(detail) => RuntimeError::InitFailed {
            detail: Some(format!("init marker JSON parse failed: {detail}")),
        },
        BridgeError::Closed
        | BridgeError::Serialize(_)
        | BridgeError::Write(_)
        | BridgeError::MissingStdin
        | BridgeError::MissingStdout => RuntimeError::stream(err.to_string()),
    }
}

/// First advertised auth method, as `authenticate` expects it.
pub fn auth_method_id(init_result: Option<&Value>) -> Option<String> {
    init_result?
        .get("authMethods")?
        .as_array()?
        .first()?
        .get("id")?
        .as_str()
        .map(str::to_string)
}

/// Runs `op` against the Run's bridge. When it fails because the agent wants
/// authentication, authenticates once and runs `op` one more time.
pub async fn with_auth_retry<T, F, Fut>(run: &Run, mut op: F) -> Result<T, RuntimeError>
where
    F: FnMut(Arc<AgentBridge>) -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let bridge = run.bridge().ok_or(RuntimeError::AgentNotConnected)?;
    let err = match op(bridge.clone()).await {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    if classify_error(&err) != ErrorClass::AuthExpired {
        return Err(err);
    }
    let Some(method_id) = auth_method_id(run.init_result().as_ref()) else {
        tracing::warn!(run_id = %run.run_id, error = %err, "auth expired but agent advertises no auth method");
        return Err(err);
    };

    let timeout = auth_timeout_from_env();
    tracing::warn!(
        run_id = %run.run_id,
        method_id = %method_id,
        timeout_ms = timeout.as_millis() as u64,
        "agent requires authentication; retrying once"
    );
    bridge
        .send_rpc("authenticate", json!({ "methodId": method_id }), Some(timeout))
        .await
        .map_err(map_bridge_error)?;
    op(bridge).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_stdio_bridge::RpcError;

    fn remote(code: i64, message: &str) -> RuntimeError {
        map_bridge_error(BridgeError::Remote(RpcError::new(code, message)))
    }

    #[test]
    fn classification_follows_code_then_message() {
        assert_eq!(classify_error(&remote(-32000, "whatever")), ErrorClass::AuthExpired);
        assert_eq!(
            classify_error(&remote(-32603, "Authentication required")),
            ErrorClass::AuthExpired
        );
        assert_eq!(classify_error(&remote(-32603, "token auth expired")), ErrorClass::AuthExpired);
        assert_eq!(classify_error(&remote(-32602, "Session not found")), ErrorClass::SessionInvalid);
        assert_eq!(classify_error(&remote(-32603, "boom")), ErrorClass::Other);
        assert_eq!(
            classify_error(&RuntimeError::invalid("session_id empty")),
            ErrorClass::Other
        );
    }

    #[test]
    fn timeouts_are_never_retried_as_session_failures() {
        let timeout = map_bridge_error(BridgeError::Timeout {
            method: "session/prompt".to_string(),
            timeout_ms: 8_000,
        });
        assert!(timeout.to_string().contains("session/prompt"), "{timeout}");
        assert_eq!(classify_error(&timeout), ErrorClass::Other);
        assert_eq!(
            classify_error(&map_bridge_error(BridgeError::InitTimeout { timeout_ms: 5 })),
            ErrorClass::Other
        );
    }

    #[test]
    fn bridge_errors_map_onto_runtime_errors() {
        assert!(matches!(
            map_bridge_error(BridgeError::NotConnected),
            RuntimeError::AgentNotConnected
        ));
        assert!(matches!(
            map_bridge_error(BridgeError::Timeout {
                method: "session/prompt".to_string(),
                timeout_ms: 5
            }),
            RuntimeError::Timeout { .. }
        ));
        assert!(matches!(
            map_bridge_error(BridgeError::ExitedBeforeInit {
                code: Some(3),
                signal: None
            }),
            RuntimeError::AgentProcessExited { code: Some(3), .. }
        ));
        assert_eq!(remote(-32000, "x").remote_code(), Some(-32000));
    }

    #[test]
    fn auth_method_comes_from_the_first_entry() {
        let init = json!({ "authMethods": [{ "id": "chatgpt" }, { "id": "apikey" }] });
        assert_eq!(auth_method_id(Some(&init)).as_deref(), Some("chatgpt"));
        assert_eq!(auth_method_id(Some(&json!({ "authMethods": [] }))), None);
        assert_eq!(auth_method_id(None), None);
    }
}
