//! Logging setup and structured message macros
//!
//! Configuration comes from the environment (`RUST_LOG`, `LSP_RPC_LOG_FILE`,
//! `LSP_RPC_LOG_UNIQUE`, `LSP_RPC_LOG_JSON`) with programmatic overrides.
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the embedding binary.

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Target used for forwarded language server stderr lines
pub const STDERR_TARGET: &str = "lsp_rpc_engine::stderr";

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "lsp_rpc_engine=trace")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let unique = env::var("LSP_RPC_LOG_UNIQUE").unwrap_or_default() == "true";
        let file_path = env::var("LSP_RPC_LOG_FILE").ok().map(|path| {
            let path_buf = PathBuf::from(path);
            if unique {
                unique_log_path(path_buf, std::process::id())
            } else {
                path_buf
            }
        });

        let json_format = env::var("LSP_RPC_LOG_JSON").unwrap_or_default() == "true";

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values set by the embedding application
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// Insert the pid before the extension: `engine.log` becomes `engine.<pid>.log`
fn unique_log_path(mut path: PathBuf, pid: u32) -> PathBuf {
    if let Some(stem) = path.file_stem() {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");

        let unique_filename = if extension.is_empty() {
            format!("{}.{}", stem.to_string_lossy(), pid)
        } else {
            format!("{}.{}.{}", stem.to_string_lossy(), pid, extension)
        };

        path.set_file_name(unique_filename);
    }
    path
}

/// Initialize the global subscriber based on configuration
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer().json().with_writer(file).with_ansi(false);

            subscriber.with(file_layer).try_init()?;
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(file_layer).try_init()?;
        }
        (None, true) => {
            let stderr_layer = fmt::layer().json().with_writer(io::stderr).with_ansi(false);

            subscriber.with(stderr_layer).try_init()?;
        }
        (None, false) => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true);

            subscriber.with(stderr_layer).try_init()?;
        }
    }

    Ok(())
}

/// Log one JSON-RPC message as a single structured event
#[macro_export]
macro_rules! log_lsp_message {
    ($level:expr, $direction:expr, $method:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            method = $method,
            data = ?$data,
            pid = std::process::id(),
            "LSP message"
        );
    };
}

/// Log how long an operation took
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracing::Level;

    #[test]
    fn test_unique_log_path_inserts_pid() {
        assert_eq!(
            unique_log_path(PathBuf::from("/var/log/engine.log"), 42),
            PathBuf::from("/var/log/engine.42.log")
        );
        assert_eq!(
            unique_log_path(PathBuf::from("engine"), 7),
            PathBuf::from("engine.7")
        );
    }

    #[test]
    fn test_overrides_replace_env_values() {
        let config = LogConfig::default()
            .with_overrides(Some("debug".to_string()), Some(PathBuf::from("x.log")));
        assert_eq!(config.level, "debug");
        assert_eq!(config.file_path, Some(PathBuf::from("x.log")));

        let config = LogConfig::default().with_overrides(None, None);
        assert_eq!(config.level, "info");
        assert!(config.file_path.is_none());
    }

    #[test]
    fn test_macros_expand_without_subscriber() {
        let params = Some(serde_json::json!({"uri": "file:///a.rs"}));
        crate::log_lsp_message!(Level::DEBUG, "outgoing", "textDocument/hover", &params);
        crate::log_timing!(Level::INFO, "initialize", Duration::from_millis(12));
    }

    #[test]
    fn test_file_logging_writes_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.log");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .unwrap();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("debug"))
            .with(fmt::layer().json().with_writer(file).with_ansi(false));

        tracing::subscriber::with_default(subscriber, || {
            crate::log_lsp_message!(Level::DEBUG, "incoming", "$/progress", &None::<()>);
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"direction\":\"incoming\""));
        assert!(contents.contains("$/progress"));
    }
}
