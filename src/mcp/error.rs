//! Error types for the MCP client
//!
//! `MessageError` covers frame-local validation and decoding failures; the
//! reader logs and discards those. `ClientError` is what callers of the
//! connection see, and is `Clone` so a single transport failure can complete
//! every pending request.

use std::time::Duration;

use serde_json::Value;

use crate::config::ConfigError;
use crate::mcp::messages::{ErrorObject, MessageId};
use crate::mcp::state::ClientState;

// ============================================================================
// Message Validation Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Invalid jsonrpc version: expected \"2.0\", got {0}")]
    InvalidVersion(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: expected {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Unexpected field in {kind}: {field}")]
    UnexpectedField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("Invalid message id: {0} (expected integer or string)")]
    InvalidId(String),

    #[error("{field} must be a JSON object")]
    NotAnObject { field: &'static str },

    #[error("Response must carry either result or error")]
    MissingResultOrError,

    #[error("Response must not carry both result and error")]
    BothResultAndError,

    #[error("Invalid error object: {0}")]
    InvalidErrorObject(String),

    #[error("Frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Client Errors
// ============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The server process could not be started at all
    #[error("Failed to spawn server '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("Connection already opened (state: {state})")]
    AlreadyOpen { state: ClientState },

    #[error("Client not ready (state: {state})")]
    NotReady { state: ClientState },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: ClientState, to: ClientState },

    #[error("Initialize handshake timed out after {timeout:?}")]
    HandshakeTimeout { timeout: Duration },

    #[error("Server rejected initialize: [{code}] {message}")]
    HandshakeRejected { code: i32, message: String },

    #[error("Transport closed: {reason}")]
    TransportClosed { reason: String },

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    #[error("Duplicate request id: {id}")]
    DuplicateId { id: MessageId },

    #[error("Request {id} timed out after {timeout:?}")]
    RequestTimeout { id: MessageId, timeout: Duration },

    #[error("Server error [{code}]: {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub(crate) fn transport_closed(reason: impl Into<String>) -> Self {
        ClientError::TransportClosed {
            reason: reason.into(),
        }
    }
}

impl From<ErrorObject> for ClientError {
    fn from(error: ErrorObject) -> Self {
        ClientError::Server {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

impl From<ConfigError> for ClientError {
    fn from(error: ConfigError) -> Self {
        ClientError::Config(error.to_string())
    }
}

impl From<MessageError> for ClientError {
    fn from(error: MessageError) -> Self {
        ClientError::Protocol(error.to_string())
    }
}
