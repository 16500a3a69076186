//! Client error types.

use mongors_protocol::Opcode;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] mongors_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect timeout")]
    Timeout,

    /// The server stopped being a writable master, or the master check
    /// failed. The factory reconnects; the caller must resubmit.
    #[error("auto-reconnect: {0}")]
    AutoReconnect(String),

    /// A command or query failed with a server-supplied code and message.
    /// The connection stays alive.
    #[error("operation failure (code {code:?}): {message}")]
    OperationFailure { code: Option<i32>, message: String },

    /// Write failed with duplicate key (server code 11000).
    #[error("duplicate key (code {code}): {message}")]
    DuplicateKey { code: i32, message: String },

    /// Client configuration contradicts the live server, e.g. a replica-set
    /// name mismatch. The connection is never published as ready.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid connection URI: {0}")]
    InvalidUri(String),

    #[error("document too large: {size} bytes (server max {max})")]
    DocumentTooLarge { size: usize, max: i32 },

    /// An admin command reply carried a document this client could not read.
    #[error("malformed server document: {0}")]
    MalformedDocument(String),

    #[error("no credential cached for database {0:?}")]
    NoCredential(String),

    /// The peer sent a message kind a server never legitimately sends.
    #[error("unexpected {0:?} message from server")]
    UnexpectedMessage(Opcode),
}

impl ClientError {
    /// Whether the caller may transparently retry after reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectionClosed
                | ClientError::Timeout
                | ClientError::AutoReconnect(_)
        )
    }
}
