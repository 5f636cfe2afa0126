//! Model Context Protocol client for servers spoken to over stdio
//!
//! The client launches the server as a child process, performs the
//! `initialize` handshake and then exchanges newline-delimited JSON-RPC
//! messages with it, matching each response to the request that produced it.

pub mod config;
pub mod io;
pub mod logging;
pub mod mcp;

#[cfg(test)]
mod test_utils;

pub use config::{ClientConfig, ClientConfigBuilder, ConfigError, IdStrategy};
pub use mcp::{ClientError, ClientState, Connection, Message, MessageId, Params, ResponseHandle};
