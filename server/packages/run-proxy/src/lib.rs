//! Run proxy: keeps a websocket link to an orchestrator and supervises one
//! sandboxed ACP agent per Run.

pub mod cli;
pub mod config;
pub mod identity;
pub mod link;
pub mod proxy;
pub mod runs;
pub mod sandbox;
pub mod secrets;
pub mod validate;
