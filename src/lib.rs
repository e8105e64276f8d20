//! Client engine for `Content-Length`-framed JSON-RPC 2.0 over a child
//! process's stdio, as spoken by language servers.
//!
//! ```no_run
//! use lsp_rpc_engine::{RpcSession, SessionConfig};
//! use lsp_rpc_engine::lsp::{DocumentPosition, TextDocumentFeatures};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::builder()
//!     .command("clangd")
//!     .arg("--background-index")
//!     .build()?;
//! let session = RpcSession::new(config);
//! session.start("file:///work/project").await?;
//!
//! let hover = session
//!     .hover(&DocumentPosition::new("file:///work/project/main.cpp", 3, 7))
//!     .await?;
//! println!("{hover}");
//!
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod io;
pub mod logging;
pub mod lsp;

#[cfg(test)]
mod test_utils;

pub use config::{ConfigError, SessionConfig, SessionConfigBuilder};
pub use lsp::{RpcError, RpcSession, SessionState};
