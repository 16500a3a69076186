//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or message decoding.
///
/// Every variant is fatal to the connection it occurred on: a stream that
/// produced a malformed envelope cannot be resynchronized.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message length: {0} (minimum is the 16-byte header)")]
    InvalidMessageLength(i32),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },

    #[error("unknown opcode: {0}")]
    UnknownOpcode(i32),

    #[error("truncated message body while reading {0}")]
    Truncated(&'static str),

    #[error("invalid document length: {0}")]
    InvalidDocumentLength(i32),

    #[error("reply advertised {expected} documents but body held {actual}")]
    DocumentCountMismatch { expected: i32, actual: usize },

    #[error("trailing bytes after message body: {0}")]
    TrailingBytes(usize),

    #[error("collection name is not valid UTF-8")]
    InvalidUtf8,

    #[error("collection name contains an interior NUL byte")]
    InteriorNul,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
