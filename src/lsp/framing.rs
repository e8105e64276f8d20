//! LSP message framing layer
//!
//! Handles LSP-specific message framing using Content-Length headers
//! as specified in the Language Server Protocol specification.
//!
//! LSP message framing format:
//! Content-Length: <length>\r\n\r\n<content>
//!
//! [`LspCodec`] is the `tokio_util` codec; [`Framer`] wraps it with its own
//! accumulation buffer for push-style decoding of raw stdout chunks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::lsp::protocol::{Message, MessageError};

/// Maximum message size to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Maximum header block size before the header boundary is considered lost
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

const CONTENT_LENGTH: &str = "Content-Length";

/// Terminal framing failures. The stream cannot be resynchronised after one.
#[derive(Debug, thiserror::Error)]
pub enum LspFramingError {
    #[error("Invalid LSP message format: {0}")]
    InvalidFormat(String),

    #[error("Invalid content length: {0}")]
    InvalidContentLength(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Header exceeds {max} bytes without a terminator")]
    HeaderTooLarge { max: usize },

    #[error("Framing already failed on this stream")]
    StreamFailed,

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded frame: either a message or the reason its body was unusable
pub type DecodedFrame = Result<Message, MessageError>;

/// Content-Length codec for JSON-RPC messages
#[derive(Debug, Default, Clone, Copy)]
pub struct LspCodec;

impl LspCodec {
    pub fn new() -> Self {
        Self
    }

    /// Parse Content-Length from LSP headers
    fn parse_content_length(header: &str) -> Result<usize, LspFramingError> {
        for line in header.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                continue;
            }

            let value = value.trim();
            let length = value
                .parse::<usize>()
                .map_err(|_| LspFramingError::InvalidContentLength(value.to_string()))?;

            if length > MAX_MESSAGE_SIZE {
                return Err(LspFramingError::MessageTooLarge {
                    size: length,
                    max: MAX_MESSAGE_SIZE,
                });
            }

            return Ok(length);
        }

        Err(LspFramingError::InvalidFormat(
            "Missing Content-Length header".to_string(),
        ))
    }
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_SEPARATOR.len())
        .position(|window| window == HEADER_SEPARATOR)
}

impl Decoder for LspCodec {
    type Item = DecodedFrame;
    type Error = LspFramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header_end) = find_header_end(src) else {
            if src.len() > MAX_HEADER_SIZE {
                return Err(LspFramingError::HeaderTooLarge {
                    max: MAX_HEADER_SIZE,
                });
            }
            return Ok(None);
        };

        let header = std::str::from_utf8(&src[..header_end]).map_err(|_| {
            LspFramingError::InvalidFormat("Header is not valid UTF-8".to_string())
        })?;
        let content_length = Self::parse_content_length(header)?;

        let content_start = header_end + HEADER_SEPARATOR.len();
        let frame_length = content_start + content_length;
        if src.len() < frame_length {
            trace!(
                "LspCodec: Incomplete message - need {} more bytes",
                frame_length - src.len()
            );
            src.reserve(frame_length - src.len());
            return Ok(None);
        }

        src.advance(content_start);
        let body = src.split_to(content_length).freeze();

        trace!("LspCodec: Parsed complete message ({} bytes)", content_length);
        Ok(Some(Message::from_slice(&body)))
    }
}

impl Encoder<&Message> for LspCodec {
    type Error = LspFramingError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(item)?;
        let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());

        trace!("LspCodec: Encoding framed message ({} bytes content)", body.len());

        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

/// Encode a single message into one contiguous wire frame
pub fn encode_message(message: &Message) -> Result<Bytes, LspFramingError> {
    let mut buffer = BytesMut::new();
    LspCodec.encode(message, &mut buffer)?;
    Ok(buffer.freeze())
}

/// Incremental decoder over an append-only byte stream
///
/// After every [`Framer::push`] the buffer holds at most a partial header or
/// a partial body.
#[derive(Debug, Default)]
pub struct Framer {
    codec: LspCodec,
    buffer: BytesMut,
    failed: bool,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and extract every complete frame it finishes
    ///
    /// Frames with malformed bodies are returned in place as errors; a
    /// header failure is terminal and poisons the framer.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<DecodedFrame>, LspFramingError> {
        let mut frames = Vec::new();
        self.push_with(chunk, |frame| frames.push(frame))?;
        Ok(frames)
    }

    /// Like [`Framer::push`], but hands each frame to `on_frame` as soon as
    /// it is decoded, so frames preceding a terminal failure are not lost
    pub fn push_with<F>(&mut self, chunk: &[u8], mut on_frame: F) -> Result<(), LspFramingError>
    where
        F: FnMut(DecodedFrame),
    {
        if self.failed {
            return Err(LspFramingError::StreamFailed);
        }

        self.buffer.extend_from_slice(chunk);

        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => on_frame(frame),
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.failed = true;
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }
}
