use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    InvalidAgentInputs,
    PathEscape,
    CapabilityMismatch,
    Conflict,
    AgentNotConnected,
    AgentProcessExited,
    StreamError,
    Timeout,
    RemoteError,
    InitFailed,
    PlatformUnsupported,
    SandboxCommandFailed,
    InstanceMissing,
    RunNotOpen,
    RunClosed,
}

impl ErrorType {
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidAgentInputs => "invalid_agent_inputs",
            Self::PathEscape => "path_escape",
            Self::CapabilityMismatch => "capability_mismatch",
            Self::Conflict => "conflict",
            Self::AgentNotConnected => "agent_not_connected",
            Self::AgentProcessExited => "agent_process_exited",
            Self::StreamError => "stream_error",
            Self::Timeout => "timeout",
            Self::RemoteError => "remote_error",
            Self::InitFailed => "init_failed",
            Self::PlatformUnsupported => "platform_unsupported",
            Self::SandboxCommandFailed => "sandbox_command_failed",
            Self::InstanceMissing => "instance_missing",
            Self::RunNotOpen => "run_not_open",
            Self::RunClosed => "run_closed",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::InvalidAgentInputs => "Invalid Agent Inputs",
            Self::PathEscape => "Path Escape",
            Self::CapabilityMismatch => "Capability Mismatch",
            Self::Conflict => "Conflict",
            Self::AgentNotConnected => "Agent Not Connected",
            Self::AgentProcessExited => "Agent Process Exited",
            Self::StreamError => "Stream Error",
            Self::Timeout => "Timeout",
            Self::RemoteError => "Remote Error",
            Self::InitFailed => "Init Failed",
            Self::PlatformUnsupported => "Platform Unsupported",
            Self::SandboxCommandFailed => "Sandbox Command Failed",
            Self::InstanceMissing => "Instance Missing",
            Self::RunNotOpen => "Run Not Open",
            Self::RunClosed => "Run Closed",
        }
    }

    /// Validation failures are raised before any side effect and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest
                | Self::InvalidAgentInputs
                | Self::PathEscape
                | Self::CapabilityMismatch
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("{message}")]
    InvalidRequest { message: String },
    #[error("{code}: {message}")]
    InvalidAgentInputs { code: String, message: String },
    #[error("{message}")]
    PathEscape { path: String, message: String },
    #[error("agent does not enable promptCapabilities.{capability}; cannot send {block_type} content")]
    CapabilityMismatch {
        block_type: String,
        capability: String,
    },
    #[error("{message}")]
    Conflict { message: String },
    #[error("agent not connected")]
    AgentNotConnected,
    #[error("agent process exited (code={}, signal={})", display_opt(.code), display_opt(.signal))]
    AgentProcessExited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    #[error("{message}")]
    StreamError { message: String },
    #[error("{message}")]
    Timeout { message: String },
    #[error("{message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("init_failed")]
    InitFailed { detail: Option<String> },
    #[error("{message}")]
    PlatformUnsupported { message: String },
    #[error("{message}")]
    SandboxCommandFailed {
        command: String,
        message: String,
    },
    #[error("sandbox instance missing: {instance_name}")]
    InstanceMissing { instance_name: String },
    #[error("run_not_open")]
    RunNotOpen { run_id: String },
    #[error("run_closed")]
    RunClosed { run_id: String },
}

fn display_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "null".to_string(),
    }
}

impl RuntimeError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::StreamError {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::InvalidAgentInputs { .. } => ErrorType::InvalidAgentInputs,
            Self::PathEscape { .. } => ErrorType::PathEscape,
            Self::CapabilityMismatch { .. } => ErrorType::CapabilityMismatch,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::AgentNotConnected => ErrorType::AgentNotConnected,
            Self::AgentProcessExited { .. } => ErrorType::AgentProcessExited,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Remote { .. } => ErrorType::RemoteError,
            Self::InitFailed { .. } => ErrorType::InitFailed,
            Self::PlatformUnsupported { .. } => ErrorType::PlatformUnsupported,
            Self::SandboxCommandFailed { .. } => ErrorType::SandboxCommandFailed,
            Self::InstanceMissing { .. } => ErrorType::InstanceMissing,
            Self::RunNotOpen { .. } => ErrorType::RunNotOpen,
            Self::RunClosed { .. } => ErrorType::RunClosed,
        }
    }

    /// Remote JSON-RPC error code, when the agent produced one.
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn to_report(&self) -> ErrorReport {
        let details = match self {
            Self::InvalidAgentInputs { code, .. } => Some(single("code", Value::from(code.clone()))),
            Self::PathEscape { path, .. } => Some(single("path", Value::from(path.clone()))),
            Self::CapabilityMismatch {
                block_type,
                capability,
            } => {
                let mut map = Map::new();
                map.insert("blockType".to_string(), Value::from(block_type.clone()));
                map.insert("capability".to_string(), Value::from(capability.clone()));
                Some(Value::Object(map))
            }
            Self::AgentProcessExited { code, signal } => {
                let mut map = Map::new();
                if let Some(code) = code {
                    map.insert("exitCode".to_string(), Value::from(*code));
                }
                if let Some(signal) = signal {
                    map.insert("signal".to_string(), Value::from(*signal));
                }
                if map.is_empty() {
                    None
                } else {
                    Some(Value::Object(map))
                }
            }
            Self::Remote { code, data, .. } => {
                let mut map = Map::new();
                map.insert("code".to_string(), Value::from(*code));
                if let Some(data) = data {
                    map.insert("data".to_string(), data.clone());
                }
                Some(Value::Object(map))
            }
            Self::InitFailed { detail } => detail
                .as_ref()
                .map(|detail| single("detail", Value::from(detail.clone()))),
            Self::SandboxCommandFailed { command, .. } => {
                Some(single("command", Value::from(command.clone())))
            }
            Self::InstanceMissing { instance_name } => {
                Some(single("instanceName", Value::from(instance_name.clone())))
            }
            Self::RunNotOpen { run_id } | Self::RunClosed { run_id } => {
                Some(single("runId", Value::from(run_id.clone())))
            }
            Self::InvalidRequest { .. }
            | Self::Conflict { .. }
            | Self::AgentNotConnected
            | Self::StreamError { .. }
            | Self::Timeout { .. }
            | Self::PlatformUnsupported { .. } => None,
        };

        let error_type = self.error_type();
        ErrorReport {
            type_: error_type,
            title: error_type.title().to_string(),
            message: self.to_string(),
            details,
        }
    }
}

fn single(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

impl From<RuntimeError> for ErrorReport {
    fn from(value: RuntimeError) -> Self {
        value.to_report()
    }
}

impl From<&RuntimeError> for ErrorReport {
    fn from(value: &RuntimeError) -> Self {
        value.to_report()
    }
}
