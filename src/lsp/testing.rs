//! Testing utilities
//!
//! An in-process fake language server connected to a session through
//! `tokio::io::duplex`. Test helpers panic on unexpected traffic.

use std::collections::VecDeque;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use crate::config::SessionConfig;
use crate::lsp::framing::Framer;
use crate::lsp::protocol::{JsonRpcNotification, JsonRpcRequest, Message};
use crate::lsp::session::RpcSession;

/// Workspace root used by tests
pub(crate) const ROOT: &str = "file:///workspace/project";

const DUPLEX_CAPACITY: usize = 64 * 1024;

pub(crate) type ClientIo = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

pub(crate) fn test_config() -> SessionConfig {
    SessionConfig::builder()
        .command("fake-language-server")
        .build()
        .expect("test config is valid")
}

/// Server side of an in-memory connection
pub(crate) struct FakeServer {
    stream: DuplexStream,
    framer: Framer,
    inbox: VecDeque<Message>,
    client_io: Option<ClientIo>,
}

/// Create a session and a fake server; the session is not started yet
pub(crate) fn connect(config: SessionConfig) -> (RpcSession, FakeServer) {
    let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
    let server = FakeServer {
        stream: server,
        framer: Framer::new(),
        inbox: VecDeque::new(),
        client_io: Some(tokio::io::split(client)),
    };
    (RpcSession::new(config), server)
}

/// A session that has completed the handshake against a fake server
pub(crate) async fn ready_session() -> (RpcSession, FakeServer) {
    let (session, mut server) = connect(test_config());
    let (reader, writer) = server.take_client_io();

    let starter = session.clone();
    let start = tokio::spawn(async move { starter.start_with_io(reader, writer, ROOT).await });

    server.complete_handshake(json!({})).await;
    start
        .await
        .expect("start task panicked")
        .expect("handshake failed");
    (session, server)
}

impl FakeServer {
    /// The reader/writer pair for `RpcSession::start_with_io`
    pub(crate) fn take_client_io(&mut self) -> ClientIo {
        self.client_io.take().expect("client io already taken")
    }

    /// Answer `initialize` and consume `initialized`
    pub(crate) async fn complete_handshake(&mut self, capabilities: Value) {
        let initialize = self.expect_request("initialize").await;
        self.respond(initialize.id, json!({ "capabilities": capabilities }))
            .await;
        self.expect_notification("initialized").await;
    }

    /// Next message written by the client
    pub(crate) async fn next_message(&mut self) -> Message {
        let mut buffer = [0u8; 4096];
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return message;
            }

            let n = self
                .stream
                .read(&mut buffer)
                .await
                .expect("read from client failed");
            assert!(n > 0, "client closed the connection");

            let frames = self.framer.push(&buffer[..n]).expect("client sent a bad frame");
            for frame in frames {
                self.inbox
                    .push_back(frame.expect("client sent a bad message"));
            }
        }
    }

    pub(crate) async fn expect_request(&mut self, method: &str) -> JsonRpcRequest {
        match self.next_message().await {
            Message::Request(request) if request.method == method => request,
            other => panic!("Expected {method} request, got: {other:?}"),
        }
    }

    pub(crate) async fn expect_notification(&mut self, method: &str) -> JsonRpcNotification {
        match self.next_message().await {
            Message::Notification(notification) if notification.method == method => notification,
            other => panic!("Expected {method} notification, got: {other:?}"),
        }
    }

    /// Next response the client sent, as raw JSON
    pub(crate) async fn expect_response(&mut self) -> Value {
        match self.next_message().await {
            Message::Response(response) => {
                serde_json::to_value(response).expect("response serializes")
            }
            other => panic!("Expected response, got: {other:?}"),
        }
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream
            .write_all(bytes)
            .await
            .expect("write to client failed");
    }

    /// Frame and send an arbitrary JSON value
    pub(crate) async fn send_value(&mut self, value: Value) {
        let body = serde_json::to_vec(&value).expect("value serializes");
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);
        self.send_raw(&frame).await;
    }

    pub(crate) async fn respond(&mut self, id: Value, result: Value) {
        self.send_value(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }
}
