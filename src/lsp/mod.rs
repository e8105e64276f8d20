//! JSON-RPC client engine for language servers
//!
//! Layered bottom-up:
//!
//! - **framing**: `Content-Length` framing over a byte stream
//! - **protocol**: JSON-RPC 2.0 envelopes and the `Message` union
//! - **pending** / **router**: request correlation and inbound dispatch
//! - **session**: process ownership, handshake, request/notify/stop
//! - **features**: typed helpers for common text document requests

pub mod error;
pub mod features;
pub mod framing;
pub mod handshake;
pub mod jsonrpc_utils;
pub mod pending;
pub mod protocol;
pub mod router;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use error::RpcError;
pub use features::{DocumentPosition, TextDocumentFeatures};
pub use framing::{Framer, LspCodec, LspFramingError};
pub use protocol::{
    JsonRpcErrorObject, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    MessageError,
};
pub use router::{NotificationObserver, RequestHandler};
pub use session::{RpcSession, SessionState};
