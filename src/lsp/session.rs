//! RPC session over a language server's stdio
//!
//! A session owns one server process (or one borrowed reader/writer pair),
//! allocates request ids, tracks pending requests, and runs the
//! `initialize` / `initialized` handshake. A single reader task feeds the
//! framer and the router; a single writer task serializes outbound frames.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lsp_types::InitializeParams;
use lsp_types::notification::{Cancel, Exit, Initialized, Notification as _};
use lsp_types::request::{Initialize, Request as _, Shutdown, WorkspaceFoldersRequest};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, trace, warn};

use crate::config::SessionConfig;
use crate::io::{
    ChildProcessManager, ChunkReader, OutboundWriter, ProcessExitEvent, ProcessExitHandler,
    ProcessManager, StderrMonitor, StdioTransport, StopMode,
};
use crate::logging::STDERR_TARGET;
use crate::lsp::error::RpcError;
use crate::lsp::framing::{DecodedFrame, Framer, encode_message};
use crate::lsp::handshake;
use crate::lsp::pending::{PendingGuard, PendingTable};
use crate::lsp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message};
use crate::lsp::router::{Routed, Router};
use crate::{log_lsp_message, log_timing};

// ============================================================================
// Session State
// ============================================================================

/// Session lifecycle: `NotStarted -> Initializing -> Ready -> Stopped`
///
/// Any state may move to `Stopped`; nothing leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Initializing,
    Ready,
    Stopped,
}

impl SessionState {
    pub fn is_ready(self) -> bool {
        self == SessionState::Ready
    }

    pub fn is_stopped(self) -> bool {
        self == SessionState::Stopped
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::NotStarted => "not started",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Roughly 30 years; stands in for deadlines that do not fit an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

// ============================================================================
// Shared Session State
// ============================================================================

struct SessionInner {
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    next_id: AtomicU64,
    pending: Arc<PendingTable>,
    router: Router,
    outbound: Mutex<Option<OutboundWriter>>,
    process: tokio::sync::Mutex<Option<ChildProcessManager>>,
    process_id: Mutex<Option<u32>>,
    server_capabilities: Mutex<Option<Value>>,
    reader_token: CancellationToken,
}

impl SessionInner {
    fn new(config: SessionConfig) -> Self {
        let pending = Arc::new(PendingTable::new());
        let (state, _) = watch::channel(SessionState::NotStarted);
        Self {
            config,
            state,
            next_id: AtomicU64::new(0),
            router: Router::new(Arc::clone(&pending)),
            pending,
            outbound: Mutex::new(None),
            process: tokio::sync::Mutex::new(None),
            process_id: Mutex::new(None),
            server_capabilities: Mutex::new(None),
            reader_token: CancellationToken::new(),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move `from -> to`; false if the session was not in `from`
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn begin_start(&self) -> Result<(), RpcError> {
        if self.transition(SessionState::NotStarted, SessionState::Initializing) {
            info!("Starting RPC session");
            Ok(())
        } else {
            Err(RpcError::AlreadyStarted)
        }
    }

    /// Wire up the transport: store the writer and spawn the reader task
    fn attach(self: &Arc<Self>, transport: StdioTransport) {
        // The writer task ends by itself once every writer clone is dropped
        let (writer, _writer_task, reader) = transport.into_parts();
        *lock(&self.outbound) = Some(writer);

        tokio::spawn(read_loop(
            Arc::downgrade(self),
            reader,
            self.reader_token.clone(),
        ));
    }

    fn send_message(&self, message: &Message) -> Result<(), RpcError> {
        let writer = lock(&self.outbound)
            .clone()
            .ok_or_else(|| RpcError::Transport("Transport is disconnected".to_string()))?;
        let frame = encode_message(message)?;
        writer.send(frame)?;
        Ok(())
    }

    fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        log_lsp_message!(Level::DEBUG, "outgoing", method, &params);
        self.send_message(&Message::Notification(JsonRpcNotification::new(
            method, params,
        )))
    }

    /// Issue a request without any state check
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = deadline_after(timeout);

        let mut receiver = self.pending.register(id, method, deadline)?;
        let mut guard = PendingGuard::new(&self.pending, id);

        log_lsp_message!(Level::DEBUG, "outgoing", method, &params);
        self.send_message(&Message::Request(JsonRpcRequest::new(id, method, params)))?;

        let outcome = match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_) if self.pending.take(id) => {
                warn!("Request {} ({}) timed out after {:?}", id, method, timeout);
                if let Err(e) = self.send_notification(Cancel::METHOD, Some(json!({ "id": id })))
                {
                    debug!("Could not send cancellation for request {}: {}", id, e);
                }
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
            // Resolved while the timer fired; the outcome is already in the slot
            Err(_) => receiver.await.unwrap_or(Err(RpcError::Cancelled)),
        };
        guard.disarm();

        log_lsp_message!(Level::DEBUG, "incoming", method, &outcome.as_ref().ok());
        outcome
    }

    fn dispatch(&self, frame: DecodedFrame) {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping message: {}", RpcError::MalformedBody(e));
                return;
            }
        };

        match self.router.route(message) {
            Routed::Reply(reply) => {
                if let Err(e) = self.send_message(&Message::Response(reply)) {
                    warn!("Failed to answer server request: {}", e);
                }
            }
            Routed::Resolved(id) => trace!("Resolved request {}", id),
            Routed::Discarded | Routed::Notified(_) => {}
        }
    }

    /// Tear everything down; safe to call any number of times
    async fn stop(&self, reason: &str) {
        let previous = self.state.send_replace(SessionState::Stopped);
        if previous != SessionState::Stopped {
            info!("Stopping RPC session ({}): {}", previous, reason);
        }

        let cancelled = self.pending.cancel_all();
        if cancelled > 0 {
            debug!("Cancelled {} pending requests", cancelled);
        }
        self.reader_token.cancel();
        lock(&self.outbound).take();

        // Held across the stop so a concurrent caller returns only once the
        // process is gone
        let mut slot = self.process.lock().await;
        if let Some(mut process) = slot.take()
            && let Err(e) = process.stop(StopMode::Graceful).await
        {
            debug!("Process stop: {}", e);
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.reader_token.cancel();
        self.pending.cancel_all();
        if let Some(process) = self.process.get_mut().as_mut() {
            process.kill_sync();
        }
    }
}

/// Reader task: stdout chunks -> framer -> router
///
/// Holds only a weak reference so an abandoned session can be dropped.
async fn read_loop(session: Weak<SessionInner>, mut reader: ChunkReader, token: CancellationToken) {
    let mut framer = Framer::new();

    let reason = loop {
        let chunk = tokio::select! {
            _ = token.cancelled() => {
                trace!("Reader task cancelled");
                return;
            }
            chunk = reader.read_chunk() => chunk,
        };

        let chunk = match chunk {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break "server closed its output".to_string(),
            Err(e) => break format!("failed to read server output: {e}"),
        };

        let Some(inner) = session.upgrade() else {
            return;
        };

        if let Err(e) = framer.push_with(&chunk, |frame| inner.dispatch(frame)) {
            let error = RpcError::from(e);
            error!("Closing connection: {}", error);
            break error.to_string();
        }
    };

    if let Some(inner) = session.upgrade() {
        inner.stop(&reason).await;
    }
}

/// Turns a server process exit into a session stop
struct SessionExitHandler {
    session: Weak<SessionInner>,
}

#[async_trait]
impl ProcessExitHandler for SessionExitHandler {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        if !session.state().is_stopped() {
            warn!(
                "Language server (PID {}) exited with code {:?}",
                event.pid, event.exit_code
            );
        }

        // The process lock may be held by a stop that is waiting on us
        tokio::spawn(async move {
            session.stop("server process exited").await;
        });
    }
}

// ============================================================================
// Public Handle
// ============================================================================

/// Handle to one RPC session; clones share the same session
///
/// Dropping the last handle kills the server process.
#[derive(Clone)]
pub struct RpcSession {
    inner: Arc<SessionInner>,
}

impl RpcSession {
    /// Create a session in the `NotStarted` state
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner::new(config)),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Wait until the state satisfies `predicate`, returning that state
    pub async fn wait_for_state<F>(&self, predicate: F) -> SessionState
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut receiver = self.inner.state.subscribe();
        match receiver.wait_for(predicate).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Raw `capabilities` value from the initialize result
    pub fn server_capabilities(&self) -> Option<Value> {
        lock(&self.inner.server_capabilities).clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// PID of the server process, if this session spawned one
    pub fn process_id(&self) -> Option<u32> {
        *lock(&self.inner.process_id)
    }

    /// Spawn the configured server, connect to it, and run the handshake
    ///
    /// `root` is the workspace root URI. On any failure the session ends up
    /// `Stopped` and cannot be restarted.
    pub async fn start(&self, root: &str) -> Result<(), RpcError> {
        let params = handshake::initialize_params(root, &self.inner.config)?;
        self.inner.begin_start()?;
        self.answer_workspace_folders(&params)?;
        let started = Instant::now();

        let transport = match self.spawn_process().await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Failed to start language server: {}", e);
                self.inner.stop("spawn failed").await;
                return Err(e);
            }
        };

        self.inner.attach(transport);
        self.handshake(params, started).await
    }

    /// Run the session over an existing reader/writer pair
    ///
    /// Same lifecycle as [`RpcSession::start`], but no process is owned.
    pub async fn start_with_io<R, W>(&self, reader: R, writer: W, root: &str) -> Result<(), RpcError>
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let params = handshake::initialize_params(root, &self.inner.config)?;
        self.inner.begin_start()?;
        self.answer_workspace_folders(&params)?;
        let started = Instant::now();

        self.inner.attach(StdioTransport::new(writer, reader));
        self.handshake(params, started).await
    }

    /// Serve `workspace/workspaceFolders` from the folders announced in `initialize`
    fn answer_workspace_folders(&self, params: &InitializeParams) -> Result<(), RpcError> {
        let folders = serde_json::to_value(&params.workspace_folders)?;
        self.inner
            .router
            .set_default_result(WorkspaceFoldersRequest::METHOD, folders);
        Ok(())
    }

    async fn spawn_process(&self) -> Result<StdioTransport, RpcError> {
        let config = &self.inner.config;
        let mut process = ChildProcessManager::new(
            config.command.clone(),
            config.args.clone(),
            config.working_directory.clone(),
        )
        .with_stop_timeout(config.shutdown_timeout);

        let sink = config.stderr_handler.clone();
        process.on_stderr_line(move |line| {
            info!(target: STDERR_TARGET, "{}", line);
            if let Some(sink) = &sink {
                sink(line);
            }
        });
        process.on_process_exit(SessionExitHandler {
            session: Arc::downgrade(&self.inner),
        });

        process
            .start()
            .await
            .map_err(|source| RpcError::Spawn {
                command: process.command().to_string(),
                source,
            })?;

        *lock(&self.inner.process_id) = process.get_state().pid();
        let transport = process.create_stdio_transport();
        *self.inner.process.lock().await = Some(process);
        Ok(transport?)
    }

    async fn handshake(&self, params: InitializeParams, started: Instant) -> Result<(), RpcError> {
        match self.initialize(params).await {
            Ok(()) => {
                log_timing!(Level::INFO, "initialize", started.elapsed());
                Ok(())
            }
            Err(e) => {
                error!("Initialize handshake failed: {}", e);
                self.inner.stop("handshake failed").await;
                Err(RpcError::handshake(e))
            }
        }
    }

    async fn initialize(&self, params: InitializeParams) -> Result<(), RpcError> {
        let params = serde_json::to_value(params)?;
        let result = self
            .inner
            .call(
                Initialize::METHOD,
                Some(params),
                self.inner.config.initialization_timeout,
            )
            .await?;

        let capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
        debug!("Server capabilities: {}", capabilities);
        *lock(&self.inner.server_capabilities) = Some(capabilities);

        self.inner
            .send_notification(Initialized::METHOD, Some(json!({})))?;

        if !self
            .inner
            .transition(SessionState::Initializing, SessionState::Ready)
        {
            return Err(RpcError::Cancelled);
        }
        info!("Language server ready");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), RpcError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            state => Err(RpcError::NotReady { state }),
        }
    }

    /// Send a request and wait for its result under the default deadline
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.request_with_timeout(method, params, self.inner.config.request_timeout)
            .await
    }

    /// Send a request with an explicit deadline
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.ensure_ready()?;
        self.inner.call(method, params, timeout).await
    }

    /// Typed variant of [`RpcSession::request`]
    pub async fn request_as<P, R>(&self, method: &str, params: P) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = match serde_json::to_value(params)? {
            Value::Null => None,
            params => Some(params),
        };
        let result = self.request(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Fire-and-forget notification
    ///
    /// Accepted while initializing or ready.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        match self.state() {
            SessionState::Initializing | SessionState::Ready => {
                self.inner.send_notification(method, params)
            }
            state => Err(RpcError::NotReady { state }),
        }
    }

    /// Observe every server notification, in arrival order
    pub fn on_notification<F>(&self, observer: F)
    where
        F: Fn(&JsonRpcNotification) + Send + Sync + 'static,
    {
        self.inner.router.add_observer(Arc::new(observer));
    }

    /// Answer server-to-client requests
    ///
    /// Without a handler every server request gets `MethodNotFound`.
    pub fn on_request<F>(&self, handler: F)
    where
        F: Fn(JsonRpcRequest) -> JsonRpcResponse + Send + Sync + 'static,
    {
        self.inner.router.set_request_handler(Arc::new(handler));
    }

    /// Stop the session: cancel pending requests and terminate the server
    pub async fn stop(&self) {
        self.inner.stop("stop requested").await;
    }

    /// Polite LSP teardown: `shutdown`, `exit`, then [`RpcSession::stop`]
    ///
    /// Failures in the polite phase are logged and do not prevent the stop.
    pub async fn shutdown(&self) {
        if self.state().is_ready() {
            let timeout = self.inner.config.shutdown_timeout;
            match self.inner.call(Shutdown::METHOD, None, timeout).await {
                Ok(_) => match self.inner.send_notification(Exit::METHOD, None) {
                    Ok(()) => {
                        let mut slot = self.inner.process.lock().await;
                        if let Some(process) = slot.as_mut()
                            && !process.wait_for_exit(timeout).await
                        {
                            debug!("Server did not exit within {:?}", timeout);
                        }
                    }
                    Err(e) => warn!("Failed to send exit notification: {}", e),
                },
                Err(e) => warn!("Shutdown request failed: {}", e),
            }
        }
        self.inner.stop("shutdown").await;
    }
}

impl fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSession")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .field("process_id", &self.process_id())
            .field("command", &self.inner.config.command)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
