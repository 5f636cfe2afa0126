//! JSON-RPC 2.0 protocol utilities
//!
//! Provides constants, helper functions, and utilities for working with
//! JSON-RPC 2.0 protocol as per https://www.jsonrpc.org/specification

use crate::mcp::messages::{ErrorObject, JsonRpcVersion, MessageId, Response, ResponseOutcome};
use serde_json::Value;

// ============================================================================
// Protocol Constants
// ============================================================================

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision requested during the initialize handshake
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Reserved key carrying out-of-band annotations inside `params` or `result`
pub const META_KEY: &str = "_meta";

/// JSON-RPC 2.0 error codes this client produces
/// https://www.jsonrpc.org/specification#error_object
pub mod error_codes {
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
}

// ============================================================================
// JSON-RPC Response Builders
// ============================================================================

/// Create a JSON-RPC error response
pub fn error_response(
    id: impl Into<MessageId>,
    code: i32,
    message: impl Into<String>,
    data: Option<Value>,
) -> Response {
    Response {
        jsonrpc: JsonRpcVersion,
        id: id.into(),
        outcome: ResponseOutcome::Error(ErrorObject {
            code,
            message: message.into(),
            data,
        }),
    }
}

/// Create a "method not found" error response
pub fn method_not_found_response(id: impl Into<MessageId>, method: &str) -> Response {
    error_response(
        id,
        error_codes::METHOD_NOT_FOUND,
        format!("Method not found: {method}"),
        None,
    )
}
