pub mod bridge;
pub mod message;
pub mod process;

pub use bridge::{
    AgentBridge, BridgeError, BridgeHandler, BridgeOptions, InitOutcome, Redactor, StderrPhase,
    DEFAULT_RPC_TIMEOUT, INIT_MARKER_PREFIX,
};
pub use message::RpcError;
pub use process::{BoxedReader, BoxedWriter, ExitInfo, ProcessError, ProcessHandle};
