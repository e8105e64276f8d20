//! Process management layer
//!
//! Handles the language server's process lifecycle and stderr forwarding,
//! separate from transport concerns. The child is owned by a wait task;
//! everything else talks to it by pid or through the kill channel.

use crate::io::transport::StdioTransport;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How long a graceful stop waits before escalating to a kill
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM first, SIGKILL if the process outlives the stop timeout
    Graceful,
    /// Kill immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited or been stopped
    Stopped,
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Process Exit Events
// ============================================================================

/// Event fired when the process exits, for whatever reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExitEvent {
    pub pid: u32,
    /// Exit code, `None` when killed by a signal or when waiting failed
    pub exit_code: Option<i32>,
}

/// Trait for handling process exit events
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    /// Called from the wait task once the process is gone
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Stderr Monitoring Trait
// ============================================================================

/// Trait for monitoring stderr output from external processes
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for stderr lines
    ///
    /// Only one handler is active; installing another replaces it. It must be
    /// installed before the process starts. Without one, stderr is still
    /// drained so the child never blocks on a full pipe.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Trait for managing external process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the external process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Stop the external process and wait for it to exit
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    /// Check if the process is currently running
    fn is_running(&self) -> bool;

    /// Hand out the stdio transport; can only be taken once per start
    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error>;

    /// Force kill without awaiting, for use from `Drop`
    fn kill_sync(&mut self);
}

/// Manages a child process spawned via `Command`
pub struct ChildProcessManager {
    command: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,

    /// Grace period for `StopMode::Graceful`
    stop_timeout: Duration,

    /// Shared with the wait task
    state: Arc<Mutex<ProcessState>>,

    /// Stdio transport (created when process starts)
    stdio_transport: Option<StdioTransport>,

    stderr_handler: Option<Box<dyn Fn(String) + Send + Sync>>,
    stderr_task: Option<JoinHandle<()>>,

    /// Owns the child and reaps it
    wait_task: Option<JoinHandle<()>>,

    /// Asks the wait task to kill the child
    kill_sender: Option<oneshot::Sender<()>>,

    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl ChildProcessManager {
    /// Create a new child process manager
    ///
    /// # Arguments
    /// * `command` - The command to execute
    /// * `args` - Command line arguments
    /// * `working_dir` - Optional working directory for the process
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command,
            args,
            working_directory: working_dir,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdio_transport: None,
            stderr_handler: None,
            stderr_task: None,
            wait_task: None,
            kill_sender: None,
            exit_handler: None,
        }
    }

    /// Override the grace period before a graceful stop escalates to a kill
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Install the handler fired when the process exits
    pub fn on_process_exit<H>(&mut self, handler: H)
    where
        H: ProcessExitHandler + 'static,
    {
        self.exit_handler = Some(Arc::new(handler));
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn lock_state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get current process state (thread-safe)
    pub fn get_state(&self) -> ProcessState {
        self.lock_state().clone()
    }

    /// Always drains stderr; lines go to the handler when one is installed
    fn spawn_stderr_monitor(&mut self, stderr: ChildStderr) {
        if self.stderr_task.is_some() {
            return;
        }

        let handler = self.stderr_handler.take();

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            trace!(
                "ChildProcessManager: Starting stderr monitoring (handler: {})",
                if handler.is_some() {
                    "installed"
                } else {
                    "draining only"
                }
            );

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        let content = line.trim_end_matches(['\r', '\n']);
                        if content.is_empty() {
                            continue;
                        }
                        match &handler {
                            Some(handler) => handler(content.to_string()),
                            None => trace!("ChildProcessManager: stderr drained: {}", content),
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }

            trace!("ChildProcessManager: stderr monitoring finished");
        });

        self.stderr_task = Some(task);
    }

    /// Spawn the task that owns the child until it exits
    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) {
        let exit_handler = self.exit_handler.clone();
        let state = Arc::clone(&self.state);
        let (kill_sender, mut kill_receiver) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            trace!("ChildProcessManager: Starting wait task for PID {}", pid);

            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_receiver => {
                    debug!("Kill requested for PID {}", pid);
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill process {}: {}", pid, e);
                    }
                    child.wait().await
                }
            };

            let exit_code = match status {
                Ok(exit_status) => {
                    info!("Process PID {} exited with status: {}", pid, exit_status);
                    exit_status.code()
                }
                Err(e) => {
                    error!("Error waiting for child process {}: {}", pid, e);
                    None
                }
            };

            *state.lock().unwrap_or_else(PoisonError::into_inner) = ProcessState::Stopped;

            if let Some(handler) = &exit_handler {
                handler
                    .on_process_exit(ProcessExitEvent { pid, exit_code })
                    .await;
            }

            trace!("ChildProcessManager: Wait task finished for PID {}", pid);
        });

        self.kill_sender = Some(kill_sender);
        self.wait_task = Some(task);
    }

    /// Give the process up to `timeout` to exit on its own
    ///
    /// Returns true once the process has been reaped.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let Some(task) = self.wait_task.as_mut() else {
            return !self.is_running();
        };
        if tokio::time::timeout(timeout, task).await.is_ok() {
            self.wait_task = None;
            true
        } else {
            false
        }
    }

    fn request_kill(&mut self) {
        if let Some(sender) = self.kill_sender.take() {
            let _ = sender.send(());
        }
    }

    /// Wait for the wait task to reap the child, killing it on timeout
    async fn await_exit(&mut self, grace: Duration) {
        let Some(mut task) = self.wait_task.take() else {
            return;
        };

        if tokio::time::timeout(grace, &mut task).await.is_ok() {
            return;
        }

        info!(
            "Process {} did not exit within {:?}, killing",
            self.command, grace
        );
        self.request_kill();
        if let Err(e) = task.await {
            debug!("Wait task ended abnormally: {}", e);
        }
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if !matches!(self.get_state(), ProcessState::NotStarted) {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder.spawn()?;

        let Some(pid) = child.id() else {
            return Err(ProcessError::Io(io::Error::other(
                "Failed to get process ID",
            )));
        };
        info!("Process started with PID: {}", pid);
        *self.lock_state() = ProcessState::Running { pid };

        // Extract stdio streams before moving the child into the wait task
        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        self.stdio_transport = Some(StdioTransport::new(stdin, stdout));
        self.spawn_stderr_monitor(stderr);
        self.spawn_wait_task(child, pid);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return Err(ProcessError::NotStarted),
        };

        // Dropping an untaken transport closes the child's stdin
        self.stdio_transport = None;

        match mode {
            StopMode::Graceful => {
                info!("Gracefully stopping process with PID: {}", pid);
                #[cfg(unix)]
                {
                    // SAFETY: signalling a pid we spawned and have not yet reaped
                    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
                        info!("Sent SIGTERM to process {}", pid);
                    }
                }
                #[cfg(not(unix))]
                self.request_kill();

                let grace = self.stop_timeout;
                self.await_exit(grace).await;
            }
            StopMode::Force => {
                info!("Force killing process with PID: {}", pid);
                self.request_kill();
                self.await_exit(Duration::ZERO).await;
            }
        }

        // stderr reaches EOF once the child is gone; abort in case a
        // grandchild still holds the pipe open
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        *self.lock_state() = ProcessState::Stopped;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error> {
        self.stdio_transport.take().ok_or(ProcessError::NotStarted)
    }

    fn kill_sync(&mut self) {
        let Some(pid) = self.get_state().pid() else {
            return;
        };

        info!("Synchronously force killing process with PID: {}", pid);

        #[cfg(unix)]
        {
            // SAFETY: signalling a pid we spawned and have not yet reaped
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }

        // The wait task reaps the child; without a runtime, kill_on_drop does
        self.request_kill();

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        *self.lock_state() = ProcessState::Stopped;
    }
}

impl StderrMonitor for ChildProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }
}

impl std::fmt::Debug for ChildProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessManager")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_directory", &self.working_directory)
            .field("state", &self.get_state())
            .field("has_exit_handler", &self.exit_handler.is_some())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct ChannelExitHandler(mpsc::UnboundedSender<ProcessExitEvent>);

    #[async_trait]
    impl ProcessExitHandler for ChannelExitHandler {
        async fn on_process_exit(&self, event: ProcessExitEvent) {
            let _ = self.0.send(event);
        }
    }

    fn sh(script: &str) -> ChildProcessManager {
        ChildProcessManager::new(
            "sh".to_string(),
            vec!["-c".to_string(), script.to_string()],
            None,
        )
    }

    fn assert_shareable<T: ProcessManager + Send + Sync>(_: &T) {}

    #[tokio::test]
    async fn test_manager_with_transport_is_shareable() {
        let mut manager = sh("cat");
        manager.start().await.unwrap();
        assert_shareable(&manager);

        let transport = manager.create_stdio_transport().unwrap();
        let shared = std::sync::Arc::new(tokio::sync::Mutex::new(manager));
        let task = tokio::spawn({
            let shared = std::sync::Arc::clone(&shared);
            async move { shared.lock().await.is_running() }
        });
        assert!(task.await.unwrap());

        shared.lock().await.stop(StopMode::Force).await.unwrap();
        drop(transport);
    }

    #[tokio::test]
    async fn test_process_state_transitions() {
        let mut manager = sh("sleep 30");

        assert_eq!(manager.get_state(), ProcessState::NotStarted);
        assert!(!manager.is_running());

        manager.start().await.unwrap();
        assert!(matches!(manager.get_state(), ProcessState::Running { .. }));

        manager.stop(StopMode::Graceful).await.unwrap();
        assert_eq!(manager.get_state(), ProcessState::Stopped);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_invalid_operations() {
        let mut manager = sh("sleep 30");

        let result = manager.stop(StopMode::Graceful).await;
        assert!(matches!(result, Err(ProcessError::NotStarted)));

        manager.start().await.unwrap();
        let result = manager.start().await;
        assert!(matches!(result, Err(ProcessError::AlreadyStarted)));

        manager.stop(StopMode::Force).await.unwrap();

        let result = manager.stop(StopMode::Graceful).await;
        assert!(matches!(result, Err(ProcessError::NotStarted)));

        // A manager is single-use
        let result = manager.start().await;
        assert!(matches!(result, Err(ProcessError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_io_error() {
        let mut manager = ChildProcessManager::new(
            "/nonexistent/language-server".to_string(),
            Vec::new(),
            None,
        );
        let result = manager.start().await;
        assert!(matches!(result, Err(ProcessError::Io(_))));
        assert_eq!(manager.get_state(), ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn test_create_transport_once() {
        let mut manager = sh("sleep 30");

        let result = manager.create_stdio_transport();
        assert!(matches!(result, Err(ProcessError::NotStarted)));

        manager.start().await.unwrap();
        let _transport = manager.create_stdio_transport().unwrap();

        let result = manager.create_stdio_transport();
        assert!(matches!(result, Err(ProcessError::NotStarted)));

        manager.stop(StopMode::Force).await.unwrap();
    }

    #[tokio::test]
    async fn test_stderr_lines_forwarded() {
        let mut manager = sh("echo 'error message' >&2; echo 'second line' >&2; sleep 1");

        let (sender, mut receiver) = mpsc::unbounded_channel();
        manager.on_stderr_line(move |line| {
            let _ = sender.send(line);
        });

        manager.start().await.unwrap();

        assert_eq!(receiver.recv().await.unwrap(), "error message");
        assert_eq!(receiver.recv().await.unwrap(), "second line");

        manager.stop(StopMode::Graceful).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_event_carries_code() {
        let mut manager = sh("exit 3");
        let (sender, mut receiver) = mpsc::unbounded_channel();
        manager.on_process_exit(ChannelExitHandler(sender));

        manager.start().await.unwrap();
        let pid = manager.get_state().pid().unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(
            event,
            ProcessExitEvent {
                pid,
                exit_code: Some(3)
            }
        );
        assert_eq!(manager.get_state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_wait_for_exit() {
        let mut manager = sh("sleep 30");
        manager.start().await.unwrap();
        assert!(!manager.wait_for_exit(Duration::from_millis(50)).await);
        manager.stop(StopMode::Force).await.unwrap();

        let mut manager = sh("exit 0");
        manager.start().await.unwrap();
        assert!(manager.wait_for_exit(Duration::from_secs(10)).await);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_graceful_stop_escalates_to_kill() {
        let mut manager =
            sh("trap '' TERM; exec sleep 30").with_stop_timeout(Duration::from_millis(200));
        let (sender, mut receiver) = mpsc::unbounded_channel();
        manager.on_process_exit(ChannelExitHandler(sender));

        manager.start().await.unwrap();
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        manager.stop(StopMode::Graceful).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));

        // Killed by a signal, so no exit code
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.exit_code, None);
    }

    #[tokio::test]
    async fn test_kill_sync_reaps_process() {
        let mut manager = sh("sleep 30");
        let (sender, mut receiver) = mpsc::unbounded_channel();
        manager.on_process_exit(ChannelExitHandler(sender));

        manager.start().await.unwrap();
        manager.kill_sync();
        assert_eq!(manager.get_state(), ProcessState::Stopped);

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.exit_code, None);
    }

    #[test]
    fn test_process_state_methods() {
        let not_started = ProcessState::NotStarted;
        assert!(!not_started.is_running());
        assert!(not_started.pid().is_none());

        let running = ProcessState::Running { pid: 12345 };
        assert!(running.is_running());
        assert_eq!(running.pid(), Some(12345));

        let stopped = ProcessState::Stopped;
        assert!(!stopped.is_running());
        assert!(stopped.pid().is_none());
    }
}
