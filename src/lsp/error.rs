//! Error types for the RPC session
//!
//! One variant per failure class. Fatal variants stop the session;
//! per-request variants are scoped to the single caller that observed them.

use std::time::Duration;

use serde_json::{Value, json};

use crate::io::{ProcessError, TransportError};
use crate::lsp::framing::LspFramingError;
use crate::lsp::protocol::{JsonRpcErrorObject, MessageError};
use crate::lsp::session::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The server process could not be started
    #[error("Failed to spawn language server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: ProcessError,
    },

    /// The initialize handshake errored or timed out
    #[error("Initialize handshake failed: {source}")]
    Handshake {
        #[source]
        source: Box<RpcError>,
    },

    /// Header block present but unusable; the stream is torn down
    #[error("Malformed message header: {0}")]
    MalformedHeader(String),

    /// Declared body length above the framing limit
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A body that did not deserialize as a JSON-RPC message
    #[error("Malformed message body: {0}")]
    MalformedBody(#[from] MessageError),

    #[error("Request timeout: {method} got no response within {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The server answered with an error object
    #[error("Server error ({code}): {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Session is not ready (state: {state})")]
    NotReady { state: SessionState },

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Request id {0} is already outstanding")]
    DuplicateRequestId(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
}

impl RpcError {
    /// Create a handshake failure wrapping its cause
    pub fn handshake(source: RpcError) -> Self {
        Self::Handshake {
            source: Box::new(source),
        }
    }

    /// Create an invalid URI error
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }

    /// Errors after which the session cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Spawn { .. }
                | RpcError::Handshake { .. }
                | RpcError::MalformedHeader(_)
                | RpcError::MessageTooLarge { .. }
        )
    }

    /// Short stable name for the failure class
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Spawn { .. } => "spawn_failure",
            RpcError::Handshake { .. } => "handshake_failure",
            RpcError::MalformedHeader(_) => "malformed_header",
            RpcError::MessageTooLarge { .. } => "message_too_large",
            RpcError::MalformedBody(_) => "malformed_body",
            RpcError::Timeout { .. } => "timeout",
            RpcError::Remote { .. } => "remote_error",
            RpcError::Cancelled => "cancelled",
            RpcError::NotReady { .. } => "not_ready",
            RpcError::AlreadyStarted => "already_started",
            RpcError::InvalidUri { .. } => "invalid_uri",
            RpcError::DuplicateRequestId(_) => "duplicate_request_id",
            RpcError::Transport(_) => "transport",
            RpcError::Serialization(_) => "serialization",
            RpcError::Process(_) => "process",
        }
    }

    /// Render the error as a structured failure result
    pub fn to_failure(&self) -> Value {
        let mut error = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let RpcError::Remote { code, data, .. } = self {
            error["code"] = json!(code);
            if let Some(data) = data {
                error["data"] = data.clone();
            }
        }
        json!({ "error": error })
    }
}

impl From<JsonRpcErrorObject> for RpcError {
    fn from(error: JsonRpcErrorObject) -> Self {
        RpcError::Remote {
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(error: TransportError) -> Self {
        RpcError::Transport(error.to_string())
    }
}

impl From<LspFramingError> for RpcError {
    fn from(error: LspFramingError) -> Self {
        match error {
            LspFramingError::MessageTooLarge { size, max } => {
                RpcError::MessageTooLarge { size, max }
            }
            LspFramingError::Serialization(e) => RpcError::Serialization(e),
            LspFramingError::Io(e) => RpcError::Transport(e.to_string()),
            other => RpcError::MalformedHeader(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_conversion() {
        let error: RpcError = JsonRpcErrorObject {
            code: -32602,
            message: "bad params".to_string(),
            data: Some(json!({"field": "position"})),
        }
        .into();

        assert!(matches!(error, RpcError::Remote { code: -32602, .. }));
        assert!(!error.is_fatal());
        assert_eq!(
            error.to_failure(),
            json!({
                "error": {
                    "kind": "remote_error",
                    "message": "Server error (-32602): bad params",
                    "code": -32602,
                    "data": {"field": "position"}
                }
            })
        );
    }

    #[test]
    fn test_framing_errors_map_to_fatal_variants() {
        let header: RpcError = LspFramingError::InvalidContentLength("abc".to_string()).into();
        assert!(matches!(header, RpcError::MalformedHeader(_)));
        assert!(header.is_fatal());

        let large: RpcError = LspFramingError::MessageTooLarge { size: 10, max: 5 }.into();
        assert!(matches!(large, RpcError::MessageTooLarge { size: 10, max: 5 }));
        assert!(large.is_fatal());
    }

    #[test]
    fn test_handshake_wraps_cause() {
        let error = RpcError::handshake(RpcError::Timeout {
            method: "initialize".to_string(),
            timeout: Duration::from_secs(30),
        });
        assert!(error.is_fatal());
        assert!(error.to_string().contains("initialize"));
        assert_eq!(error.to_failure()["error"]["kind"], "handshake_failure");
    }

    #[test]
    fn test_per_request_errors_are_not_fatal() {
        assert!(!RpcError::Cancelled.is_fatal());
        assert!(
            !RpcError::NotReady {
                state: SessionState::Initializing
            }
            .is_fatal()
        );
    }
}
