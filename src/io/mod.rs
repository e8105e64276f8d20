//! I/O layer - process management and byte transport
//!
//! - **Process**: the language server's lifecycle with stdio integration
//! - **Transport**: serialized frame writer and chunk reader over stdio
//!
//! Nothing here knows about JSON-RPC; framing lives in `lsp::framing`.

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    ProcessState, StderrMonitor, StopMode,
};
pub use transport::{ChunkReader, OutboundWriter, StdioTransport, TransportError};
