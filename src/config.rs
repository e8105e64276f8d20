//! Session configuration
//!
//! `SessionConfig` is assembled through `SessionConfigBuilder`, which applies
//! defaults and validates the result before a session ever sees it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default deadline for an ordinary request (30 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default deadline for the `initialize` request (30 seconds)
///
/// Servers often scan the workspace before answering, so this is kept
/// separate from the per-request deadline.
pub const DEFAULT_INITIALIZATION_TIMEOUT_SECS: u64 = 30;

/// Default bound on the polite `shutdown` request and on process exit (2 seconds)
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 2;

/// Maximum allowed initialization timeout (5 minutes)
pub const MAX_INITIALIZATION_TIMEOUT_SECS: u64 = 300;

/// Maximum allowed request timeout (1 hour)
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 3600;

pub const DEFAULT_CLIENT_NAME: &str = env!("CARGO_PKG_NAME");
pub const DEFAULT_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sink for the server's stderr lines
pub type StderrHandler = Arc<dyn Fn(String) + Send + Sync>;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid command: '{command}' - {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },

    #[error("Invalid arguments: {args:?} - {reason}")]
    InvalidArguments { args: Vec<String>, reason: String },
}

impl ConfigError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }

    pub fn invalid_arguments(args: Vec<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            args,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Core Configuration Types
// ============================================================================

/// Complete RPC session configuration
#[derive(Clone)]
pub struct SessionConfig {
    /// Language server executable
    pub command: String,

    /// Language server arguments
    pub args: Vec<String>,

    /// Working directory for the server process
    pub working_directory: Option<PathBuf>,

    /// Deadline for requests issued without an explicit timeout
    pub request_timeout: Duration,

    /// Deadline for the `initialize` request
    pub initialization_timeout: Duration,

    /// Bound on the `shutdown` request and on the process exiting afterwards
    pub shutdown_timeout: Duration,

    /// Reported as `clientInfo` during initialization
    pub client_name: String,
    pub client_version: String,

    /// Passed through verbatim as `initializationOptions`
    pub initialization_options: Option<Value>,

    /// Optional sink for server stderr lines, in addition to tracing
    pub stderr_handler: Option<StderrHandler>,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_directory", &self.working_directory)
            .field("request_timeout", &self.request_timeout)
            .field("initialization_timeout", &self.initialization_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("client_name", &self.client_name)
            .field("client_version", &self.client_version)
            .field("initialization_options", &self.initialization_options)
            .field(
                "stderr_handler",
                &self.stderr_handler.as_ref().map(|_| "Fn(String)"),
            )
            .finish()
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for SessionConfig with validation and defaults
#[derive(Default)]
pub struct SessionConfigBuilder {
    command: Option<String>,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    request_timeout: Option<Duration>,
    initialization_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    client_name: Option<String>,
    client_version: Option<String>,
    initialization_options: Option<Value>,
    stderr_handler: Option<StderrHandler>,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the language server executable
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn initialization_timeout(mut self, timeout: Duration) -> Self {
        self.initialization_timeout = Some(timeout);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = Some(version.into());
        self
    }

    pub fn initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = Some(options);
        self
    }

    /// Set the sink for server stderr lines
    pub fn stderr_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let command = self
            .command
            .ok_or_else(|| ConfigError::missing_field("command"))?;

        let config = SessionConfig {
            command,
            args: self.args,
            working_directory: self.working_directory,
            request_timeout: self
                .request_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
            initialization_timeout: self
                .initialization_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_INITIALIZATION_TIMEOUT_SECS)),
            shutdown_timeout: self
                .shutdown_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)),
            client_name: self
                .client_name
                .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string()),
            client_version: self
                .client_version
                .unwrap_or_else(|| DEFAULT_CLIENT_VERSION.to_string()),
            initialization_options: self.initialization_options,
            stderr_handler: self.stderr_handler,
        };

        Self::validate_command(&config.command)?;
        Self::validate_arguments(&config.args)?;
        Self::validate_timeouts(&config)?;

        Ok(config)
    }

    fn validate_command(command: &str) -> Result<(), ConfigError> {
        if command.trim().is_empty() {
            return Err(ConfigError::invalid_command(
                command,
                "Command cannot be empty",
            ));
        }

        if command.contains('\0') {
            return Err(ConfigError::invalid_command(
                command,
                "Command contains null character",
            ));
        }

        // Existence is checked by the spawn itself; the command may be on PATH.
        Ok(())
    }

    fn validate_arguments(args: &[String]) -> Result<(), ConfigError> {
        if args.iter().any(|arg| arg.contains('\0')) {
            return Err(ConfigError::invalid_arguments(
                args.to_vec(),
                "Arguments cannot contain null characters",
            ));
        }
        Ok(())
    }

    fn validate_timeouts(config: &SessionConfig) -> Result<(), ConfigError> {
        let timeouts = [
            (config.request_timeout, "Request timeout"),
            (config.initialization_timeout, "Initialization timeout"),
            (config.shutdown_timeout, "Shutdown timeout"),
        ];
        for (timeout, name) in timeouts {
            if timeout.is_zero() {
                return Err(ConfigError::invalid_timeout(
                    timeout,
                    format!("{name} must be greater than zero"),
                ));
            }
        }

        if config.request_timeout > Duration::from_secs(MAX_REQUEST_TIMEOUT_SECS) {
            return Err(ConfigError::invalid_timeout(
                config.request_timeout,
                "Request timeout too long (max 1 hour)",
            ));
        }

        if config.initialization_timeout > Duration::from_secs(MAX_INITIALIZATION_TIMEOUT_SECS) {
            return Err(ConfigError::invalid_timeout(
                config.initialization_timeout,
                "Initialization timeout too long (max 5 minutes)",
            ));
        }

        Ok(())
    }
}
