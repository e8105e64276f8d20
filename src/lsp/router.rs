//! Inbound message routing
//!
//! Responses go to the pending table, notifications to observers, and
//! server-to-client requests to the registered request handler. The router
//! does no I/O: replies to server requests are returned to the caller.
//!
//! Observers and handlers are user code running on the reader task; a panic
//! in one is caught and logged so routing continues.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use lsp_types::request::{Request as _, WorkDoneProgressCreate};
use serde_json::Value;
use tracing::{Level, debug, error, warn};

use crate::log_lsp_message;
use crate::lsp::jsonrpc_utils::{
    internal_error_response, method_not_found_response, success_response,
};
use crate::lsp::pending::PendingTable;
use crate::lsp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message};

/// Observer for server-to-client notifications
pub type NotificationObserver = Arc<dyn Fn(&JsonRpcNotification) + Send + Sync>;

/// Handler for server-to-client requests
pub type RequestHandler = Arc<dyn Fn(JsonRpcRequest) -> JsonRpcResponse + Send + Sync>;

/// What the router did with one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// A pending request was resolved
    Resolved(u64),
    /// A response matched no pending request and was dropped
    Discarded,
    /// A notification was handed to this many observers
    Notified(usize),
    /// A server request was answered; the reply must be written back
    Reply(JsonRpcResponse),
}

pub struct Router {
    pending: Arc<PendingTable>,
    observers: RwLock<Vec<NotificationObserver>>,
    request_handler: RwLock<Option<RequestHandler>>,
    default_results: RwLock<HashMap<String, Value>>,
}

impl Router {
    pub fn new(pending: Arc<PendingTable>) -> Self {
        let default_results =
            HashMap::from([(WorkDoneProgressCreate::METHOD.to_string(), Value::Null)]);
        Self {
            pending,
            observers: RwLock::new(Vec::new()),
            request_handler: RwLock::new(None),
            default_results: RwLock::new(default_results),
        }
    }

    pub fn add_observer(&self, observer: NotificationObserver) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn set_request_handler(&self, handler: RequestHandler) {
        *self
            .request_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Answer `method` with `result` when no request handler is registered
    pub fn set_default_result(&self, method: &str, result: Value) {
        self.default_results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.to_string(), result);
    }

    /// Route one decoded message
    pub fn route(&self, message: Message) -> Routed {
        match message {
            Message::Response(response) => self.route_response(response),
            Message::Notification(notification) => self.route_notification(notification),
            Message::Request(request) => self.route_request(request),
        }
    }

    fn route_response(&self, response: JsonRpcResponse) -> Routed {
        let Some(id) = response.numeric_id() else {
            match &response.error {
                Some(error) => warn!(
                    "Server reported an error without a usable id: {} ({})",
                    error.message, error.code
                ),
                None => debug!("Discarding response with non-numeric id {}", response.id),
            }
            return Routed::Discarded;
        };

        let outcome = response.into_outcome().map_err(Into::into);
        if self.pending.resolve(id, outcome) {
            Routed::Resolved(id)
        } else {
            debug!("Received response for unknown request {}", id);
            Routed::Discarded
        }
    }

    fn route_notification(&self, notification: JsonRpcNotification) -> Routed {
        log_lsp_message!(
            Level::TRACE,
            "incoming",
            notification.method.as_str(),
            &notification.params
        );

        // Snapshot so observers may register further observers.
        let observers: Vec<NotificationObserver> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for observer in &observers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(&notification))) {
                error!(
                    "Notification observer panicked on {}: {}",
                    notification.method,
                    panic_message(&*panic)
                );
            }
        }
        Routed::Notified(observers.len())
    }

    fn route_request(&self, request: JsonRpcRequest) -> Routed {
        debug!(
            "Received server request {} ({})",
            request.method, request.id
        );

        let handler = self
            .request_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(handler) = handler else {
            return Routed::Reply(self.default_reply(request));
        };

        let id = request.id.clone();
        let method = request.method.clone();
        let reply = match catch_unwind(AssertUnwindSafe(|| handler(request))) {
            Ok(reply) => reply,
            Err(panic) => {
                let message = panic_message(&*panic);
                error!("Request handler panicked on {}: {}", method, message);
                internal_error_response(id, format!("Request handler failed: {message}"))
            }
        };
        Routed::Reply(reply)
    }

    fn default_reply(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let result = self
            .default_results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.method)
            .cloned();

        match result {
            Some(result) => success_response(request.id, result),
            None => method_not_found_response(request.id, &request.method),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
