//! JSON-RPC 2.0 message model
//!
//! Envelope types for requests, responses and notifications, plus the
//! [`Message`] tagged union the framer produces and the session routes.
//!
//! Classification of an inbound object follows the JSON-RPC 2.0 rules:
//!
//! - `method` + `id` => server-to-client request
//! - `method` without `id` => notification
//! - `id` + (`result` | `error`) without `method` => response

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::lsp::jsonrpc_utils::JSONRPC_VERSION;

// ============================================================================
// JSON-RPC Types
// ============================================================================

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier
    pub id: Value,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response message
///
/// Exactly one of `result` and `error` is set. A `null` result is a valid
/// success and is kept as `Some(Value::Null)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier (matches the request)
    pub id: Value,

    /// Result (present if successful)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (present if failed)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

/// JSON-RPC 2.0 notification message (no response expected)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request with a numeric id
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.into(),
            params,
        }
    }
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

impl JsonRpcResponse {
    /// Numeric id of the response, if it has one
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_u64()
    }

    /// Split the response into its success value or its error object
    pub fn into_outcome(self) -> Result<Value, JsonRpcErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ============================================================================
// Message Union
// ============================================================================

/// Any JSON-RPC 2.0 message exchanged with the server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Reason a decoded body is not a usable JSON-RPC message
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid JSON-RPC message: {0}")]
    InvalidMessage(String),
}

impl Message {
    /// Parse a message body as received from the wire
    pub fn from_slice(body: &[u8]) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    /// Classify a JSON value as a request, response or notification
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let Value::Object(mut object) = value else {
            return Err(MessageError::InvalidMessage(
                "expected a JSON object".to_string(),
            ));
        };

        match object.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            Some(other) => {
                return Err(MessageError::InvalidMessage(format!(
                    "unsupported jsonrpc version: {other}"
                )));
            }
            None => {
                return Err(MessageError::InvalidMessage(
                    "missing jsonrpc version".to_string(),
                ));
            }
        }

        let params = object.remove("params");

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Err(MessageError::InvalidMessage(
                    "method must be a string".to_string(),
                ));
            };

            return Ok(match take_id(&mut object) {
                Some(id) => Message::Request(JsonRpcRequest {
                    jsonrpc: JSONRPC_VERSION.to_string(),
                    id,
                    method,
                    params,
                }),
                None => Message::Notification(JsonRpcNotification::new(method, params)),
            });
        }

        let has_result = object.contains_key("result");
        let error = match object.remove("error") {
            Some(Value::Null) | None => None,
            Some(error) => Some(serde_json::from_value::<JsonRpcErrorObject>(error)?),
        };

        if !has_result && error.is_none() {
            return Err(MessageError::InvalidMessage(
                "message has neither method nor result/error".to_string(),
            ));
        }

        let id = object.remove("id").ok_or_else(|| {
            MessageError::InvalidMessage("response is missing its id".to_string())
        })?;

        let result = if error.is_some() {
            None
        } else {
            Some(object.remove("result").unwrap_or(Value::Null))
        };

        Ok(Message::Response(JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
            error,
        }))
    }

    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Response(_) => None,
        }
    }
}

/// Remove the id from an object, treating `null` as absent
fn take_id(object: &mut Map<String, Value>) -> Option<Value> {
    match object.remove("id") {
        Some(Value::Null) | None => None,
        Some(id) => Some(id),
    }
}

impl From<JsonRpcRequest> for Message {
    fn from(request: JsonRpcRequest) -> Self {
        Message::Request(request)
    }
}

impl From<JsonRpcResponse> for Message {
    fn from(response: JsonRpcResponse) -> Self {
        Message::Response(response)
    }
}

impl From<JsonRpcNotification> for Message {
    fn from(notification: JsonRpcNotification) -> Self {
        Message::Notification(notification)
    }
}
