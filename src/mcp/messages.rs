//! MCP message model
//!
//! Typed JSON-RPC 2.0 requests, notifications and responses as spoken by MCP
//! servers over stdio. Invalid shapes are rejected at construction/decoding
//! time so the rest of the client only ever sees well-formed messages:
//!
//! - the protocol tag is always `"2.0"`
//! - a notification never carries an `id` (not even `null`)
//! - a response carries exactly one of `result` / `error`
//!
//! Wire framing is one compact JSON object followed by a single `\n`.

use crate::mcp::error::MessageError;
use crate::mcp::jsonrpc_utils::{JSONRPC_VERSION, META_KEY};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Parameter / result payload: a JSON object
pub type Params = Map<String, Value>;

// ============================================================================
// Protocol Tag
// ============================================================================

/// The `jsonrpc` protocol tag; only `"2.0"` is representable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl JsonRpcVersion {
    /// Validate a protocol tag taken from untrusted input
    pub fn parse(tag: &str) -> Result<Self, MessageError> {
        if tag == JSONRPC_VERSION {
            Ok(Self)
        } else {
            Err(MessageError::InvalidVersion(tag.to_string()))
        }
    }

    pub fn as_str(&self) -> &'static str {
        JSONRPC_VERSION
    }
}

impl Serialize for JsonRpcVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

// ============================================================================
// Message Identifier
// ============================================================================

/// Request identifier: either an integer or a string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl MessageId {
    fn from_value(value: Value) -> Result<Self, MessageError> {
        match value {
            Value::Number(number) => number
                .as_i64()
                .map(MessageId::Number)
                .ok_or_else(|| MessageError::InvalidId(number.to_string())),
            Value::String(s) => Ok(MessageId::String(s)),
            other => Err(MessageError::InvalidId(other.to_string())),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for MessageId {
    fn from(value: i64) -> Self {
        MessageId::Number(value)
    }
}

impl From<i32> for MessageId {
    fn from(value: i32) -> Self {
        MessageId::Number(i64::from(value))
    }
}

impl From<u32> for MessageId {
    fn from(value: u32) -> Self {
        MessageId::Number(i64::from(value))
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        MessageId::String(value)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        MessageId::String(value.to_string())
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// JSON-RPC 2.0 request (expects a response)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct Request {
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    pub id: MessageId,
}

/// JSON-RPC 2.0 notification (no `id`, never answered)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct Notification {
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Exactly one of `result` or `error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseOutcome {
    Result(Params),
    Error(ErrorObject),
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct Response {
    pub jsonrpc: JsonRpcVersion,
    pub id: MessageId,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

/// Any message that can appear on the wire
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Message::Request(request) => request.serialize(serializer),
            Message::Notification(notification) => notification.serialize(serializer),
            Message::Response(response) => response.serialize(serializer),
        }
    }
}

// ============================================================================
// Construction
// ============================================================================

impl Request {
    pub fn new(id: impl Into<MessageId>, method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
            id: id.into(),
        }
    }

    /// Build a request from an untrusted protocol tag
    pub fn from_parts(
        jsonrpc: &str,
        id: impl Into<MessageId>,
        method: impl Into<String>,
        params: Option<Params>,
    ) -> Result<Self, MessageError> {
        Ok(Self {
            jsonrpc: JsonRpcVersion::parse(jsonrpc)?,
            method: method.into(),
            params,
            id: id.into(),
        })
    }

    pub fn has_metadata(&self) -> bool {
        has_meta(self.params.as_ref())
    }

    /// The `_meta` entry of `params`, if present
    pub fn metadata(&self) -> Option<&Value> {
        meta(self.params.as_ref())
    }
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }

    /// Build a notification from untrusted parts; any `id` is rejected
    pub fn from_parts(
        jsonrpc: &str,
        method: impl Into<String>,
        params: Option<Params>,
        id: Option<MessageId>,
    ) -> Result<Self, MessageError> {
        if id.is_some() {
            return Err(MessageError::UnexpectedField {
                kind: "notification",
                field: "id",
            });
        }
        Ok(Self {
            jsonrpc: JsonRpcVersion::parse(jsonrpc)?,
            method: method.into(),
            params,
        })
    }

    pub fn has_metadata(&self) -> bool {
        has_meta(self.params.as_ref())
    }

    pub fn metadata(&self) -> Option<&Value> {
        meta(self.params.as_ref())
    }
}

impl Response {
    /// Build a response from untrusted parts, enforcing result/error exclusivity
    pub fn from_parts(
        jsonrpc: &str,
        id: impl Into<MessageId>,
        result: Option<Params>,
        error: Option<ErrorObject>,
    ) -> Result<Self, MessageError> {
        let jsonrpc = JsonRpcVersion::parse(jsonrpc)?;
        let outcome = match (result, error) {
            (Some(result), None) => ResponseOutcome::Result(result),
            (None, Some(error)) => ResponseOutcome::Error(error),
            (Some(_), Some(_)) => return Err(MessageError::BothResultAndError),
            (None, None) => return Err(MessageError::MissingResultOrError),
        };
        Ok(Self {
            jsonrpc,
            id: id.into(),
            outcome,
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ResponseOutcome::Error(_))
    }

    pub fn result(&self) -> Option<&Params> {
        match &self.outcome {
            ResponseOutcome::Result(result) => Some(result),
            ResponseOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorObject> {
        match &self.outcome {
            ResponseOutcome::Error(error) => Some(error),
            ResponseOutcome::Result(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Params, ErrorObject> {
        match self.outcome {
            ResponseOutcome::Result(result) => Ok(result),
            ResponseOutcome::Error(error) => Err(error),
        }
    }

    /// Metadata lives in `result`; error responses never carry it
    pub fn has_metadata(&self) -> bool {
        has_meta(self.result())
    }

    pub fn metadata(&self) -> Option<&Value> {
        meta(self.result())
    }

    /// Decode one frame that must be a response
    pub fn decode(frame: &[u8]) -> Result<Self, MessageError> {
        Response::try_from(RawMessage::from_frame(frame)?)
    }
}

impl Message {
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Response(_) => None,
        }
    }

    pub fn id(&self) -> Option<&MessageId> {
        match self {
            Message::Request(request) => Some(&request.id),
            Message::Response(response) => Some(&response.id),
            Message::Notification(_) => None,
        }
    }
}

fn has_meta(payload: Option<&Params>) -> bool {
    payload.is_some_and(|map| map.contains_key(META_KEY))
}

fn meta(payload: Option<&Params>) -> Option<&Value> {
    payload.and_then(|map| map.get(META_KEY))
}

// ============================================================================
// Framing
// ============================================================================

/// Newline-delimited JSON encoding shared by every message kind
pub trait FrameEncode: Serialize {
    /// Compact UTF-8 JSON followed by exactly one `\n`
    fn encode_frame(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

impl FrameEncode for Request {}
impl FrameEncode for Notification {}
impl FrameEncode for Response {}
impl FrameEncode for Message {}

/// Encode any message into a wire frame
pub fn encode<M: FrameEncode>(message: &M) -> Result<Vec<u8>, MessageError> {
    message.encode_frame()
}

/// Decode one wire frame (trailing newline optional) into a message
pub fn decode(frame: &[u8]) -> Result<Message, MessageError> {
    Message::try_from(RawMessage::from_frame(frame)?)
}

// ============================================================================
// Decoding and Validation
// ============================================================================

/// Top-level members of a frame, with "absent" distinct from `null`
#[derive(Debug, Default)]
struct RawMessage {
    jsonrpc: Option<Value>,
    id: Option<Value>,
    method: Option<Value>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<Value>,
}

impl RawMessage {
    fn from_frame(frame: &[u8]) -> Result<Self, MessageError> {
        let frame = frame.strip_suffix(b"\n").unwrap_or(frame);
        let frame = frame.strip_suffix(b"\r").unwrap_or(frame);
        let text = std::str::from_utf8(frame)?;
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self, MessageError> {
        let Value::Object(mut map) = value else {
            return Err(MessageError::NotAnObject { field: "message" });
        };
        Ok(Self {
            jsonrpc: map.remove("jsonrpc"),
            id: map.remove("id"),
            method: map.remove("method"),
            params: map.remove("params"),
            result: map.remove("result"),
            error: map.remove("error"),
        })
    }

    fn version(&mut self) -> Result<JsonRpcVersion, MessageError> {
        match self.jsonrpc.take() {
            Some(Value::String(tag)) => JsonRpcVersion::parse(&tag),
            Some(other) => Err(MessageError::InvalidVersion(other.to_string())),
            None => Err(MessageError::MissingField("jsonrpc")),
        }
    }

    fn method(&mut self) -> Result<String, MessageError> {
        match self.method.take() {
            Some(Value::String(method)) => Ok(method),
            Some(_) => Err(MessageError::InvalidField {
                field: "method",
                expected: "a string",
            }),
            None => Err(MessageError::MissingField("method")),
        }
    }

    fn id(&mut self) -> Result<MessageId, MessageError> {
        self.id
            .take()
            .ok_or(MessageError::MissingField("id"))
            .and_then(MessageId::from_value)
    }

    fn params(&mut self) -> Result<Option<Params>, MessageError> {
        match self.params.take() {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(params)) => Ok(Some(params)),
            Some(_) => Err(MessageError::NotAnObject { field: "params" }),
        }
    }

    fn result(&mut self) -> Result<Option<Params>, MessageError> {
        match self.result.take() {
            None => Ok(None),
            Some(Value::Object(result)) => Ok(Some(result)),
            Some(_) => Err(MessageError::NotAnObject { field: "result" }),
        }
    }

    fn error(&mut self) -> Result<Option<ErrorObject>, MessageError> {
        self.error
            .take()
            .map(|value| {
                serde_json::from_value(value)
                    .map_err(|e| MessageError::InvalidErrorObject(e.to_string()))
            })
            .transpose()
    }
}

impl TryFrom<RawMessage> for Request {
    type Error = MessageError;

    fn try_from(mut raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            jsonrpc: raw.version()?,
            method: raw.method()?,
            params: raw.params()?,
            id: raw.id()?,
        })
    }
}

impl TryFrom<RawMessage> for Notification {
    type Error = MessageError;

    fn try_from(mut raw: RawMessage) -> Result<Self, Self::Error> {
        let jsonrpc = raw.version()?;
        if raw.id.is_some() {
            return Err(MessageError::UnexpectedField {
                kind: "notification",
                field: "id",
            });
        }
        Ok(Self {
            jsonrpc,
            method: raw.method()?,
            params: raw.params()?,
        })
    }
}

impl TryFrom<RawMessage> for Response {
    type Error = MessageError;

    fn try_from(mut raw: RawMessage) -> Result<Self, Self::Error> {
        let jsonrpc = raw.version()?;
        if raw.method.is_some() {
            return Err(MessageError::UnexpectedField {
                kind: "response",
                field: "method",
            });
        }
        let id = raw.id()?;
        let outcome = match (raw.result()?, raw.error()?) {
            (Some(result), None) => ResponseOutcome::Result(result),
            (None, Some(error)) => ResponseOutcome::Error(error),
            (Some(_), Some(_)) => return Err(MessageError::BothResultAndError),
            (None, None) => return Err(MessageError::MissingResultOrError),
        };
        Ok(Self {
            jsonrpc,
            id,
            outcome,
        })
    }
}

impl TryFrom<RawMessage> for Message {
    type Error = MessageError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        match (&raw.method, &raw.id) {
            (Some(_), Some(_)) => Request::try_from(raw).map(Message::Request),
            (Some(_), None) => Notification::try_from(raw).map(Message::Notification),
            (None, _) => Response::try_from(raw).map(Message::Response),
        }
    }
}

macro_rules! try_from_value {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<Value> for $ty {
                type Error = MessageError;

                fn try_from(value: Value) -> Result<Self, Self::Error> {
                    <$ty>::try_from(RawMessage::from_value(value)?)
                }
            }
        )*
    };
}

try_from_value!(Request, Notification, Response, Message);
