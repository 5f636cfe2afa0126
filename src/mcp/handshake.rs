//! Initialize handshake payloads
//!
//! The client opens every session with an `initialize` request (id 1) and,
//! once the server answers, announces `notifications/initialized`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::mcp::error::MessageError;
use crate::mcp::messages::{MessageId, Params, Request};

/// Identifier reserved for the `initialize` request
pub const HANDSHAKE_REQUEST_ID: i64 = 1;

pub const INITIALIZE_METHOD: &str = "initialize";

pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

/// Name/version pair identifying a client or server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// What the server reported in its `initialize` result
///
/// Only `protocolVersion` matters to the connection; capabilities are kept
/// verbatim for callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,

    #[serde(default)]
    pub capabilities: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl InitializeResult {
    pub fn from_result(result: Params) -> Result<Self, MessageError> {
        Ok(serde_json::from_value(Value::Object(result))?)
    }
}

/// Build the `initialize` request sent as the first frame of a session
pub fn initialize_request(
    protocol_version: &str,
    client_info: &Implementation,
    capabilities: &Value,
) -> Request {
    let params = json!({
        "protocolVersion": protocol_version,
        "capabilities": capabilities,
        "clientInfo": client_info,
    });
    let params = match params {
        Value::Object(map) => map,
        _ => Params::new(),
    };
    Request::new(MessageId::from(HANDSHAKE_REQUEST_ID), INITIALIZE_METHOD, Some(params))
}
