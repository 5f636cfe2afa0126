//! MCP client over stdio
//!
//! - `messages`: typed JSON-RPC messages and newline framing
//! - `pending`: in-flight request registry and response handles
//! - `reader`: background task demultiplexing server output
//! - `state`: connection lifecycle
//! - `client`: the connection tying it all together

pub mod client;
pub mod error;
pub mod handshake;
pub mod jsonrpc_utils;
pub mod messages;
pub mod pending;
pub mod reader;
pub mod state;

pub use client::Connection;
pub use error::{ClientError, MessageError};
pub use handshake::{Implementation, InitializeResult};
pub use messages::{
    ErrorObject, Message, MessageId, Notification, Params, Request, Response, ResponseOutcome,
    decode, encode,
};
pub use pending::{PendingRequests, ResponseHandle};
pub use state::ClientState;
