//! Transport layer - byte-level I/O for the server's stdio
//!
//! The outbound half is a single writer task draining a channel of complete
//! frames, so concurrent senders never interleave partial frames. The
//! inbound half hands raw stdout chunks to whoever owns the decode loop.

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace};

// ============================================================================
// Constants
// ============================================================================

/// Size of the read buffer for stdout reading operations
const READ_BUFFER_SIZE: usize = 4096;

/// Error types for stdio transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,
}

// ============================================================================
// Outbound Writer
// ============================================================================

/// Cloneable handle for queueing frames onto the writer task
#[derive(Debug, Clone)]
pub struct OutboundWriter {
    sender: mpsc::UnboundedSender<Bytes>,
}

impl OutboundWriter {
    /// Spawn the writer task over `writer` and return its handle
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::writer_task(writer, receiver));
        (Self { sender }, task)
    }

    /// Queue one complete frame; it is written as a single unit
    pub fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        self.sender
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Background task that writes frames to the server's stdin
    ///
    /// Ends when every handle is dropped or a write fails; the stream is
    /// shut down so the server sees EOF.
    async fn writer_task<W>(mut writer: W, mut receiver: mpsc::UnboundedReceiver<Bytes>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        while let Some(frame) = receiver.recv().await {
            trace!("OutboundWriter: Writing frame (length: {})", frame.len());

            if let Err(e) = writer.write_all(&frame).await {
                error!("Failed to write to stdin: {}", e);
                break;
            }

            if let Err(e) = writer.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }

        let _ = writer.shutdown().await;
        trace!("OutboundWriter: writer task finished");
    }
}

// ============================================================================
// Inbound Reader
// ============================================================================

/// Reads raw chunks from the server's stdout
pub struct ChunkReader {
    reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
    buffer: Box<[u8; READ_BUFFER_SIZE]>,
}

impl ChunkReader {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            buffer: Box::new([0u8; READ_BUFFER_SIZE]),
        }
    }

    /// Next chunk of bytes, or `None` at end of stream
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        let n = self.reader.read(self.buffer.as_mut()).await?;
        if n == 0 {
            trace!("ChunkReader: stdout reached EOF");
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buffer[..n])))
    }
}

// ============================================================================
// Stdio Transport
// ============================================================================

/// Both halves of a server connection
pub struct StdioTransport {
    writer: OutboundWriter,
    writer_task: JoinHandle<()>,
    reader: ChunkReader,
}

impl StdioTransport {
    /// Create a transport from the server's stdin (writer) and stdout (reader)
    pub fn new<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Sync + Unpin + 'static,
    {
        let (writer, writer_task) = OutboundWriter::spawn(writer);
        Self {
            writer,
            writer_task,
            reader: ChunkReader::new(reader),
        }
    }

    pub fn into_parts(self) -> (OutboundWriter, JoinHandle<()>, ChunkReader) {
        (self.writer, self.writer_task, self.reader)
    }
}

// ============================================================================
// Tests
// ============================================================================
