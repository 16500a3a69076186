//! Stateful stream decoder for wire messages.

use crate::error::ProtocolError;
use crate::message::Message;
use bytes::{Bytes, BytesMut};

/// Turns a raw, possibly-fragmented byte stream into discrete typed messages.
///
/// Feeding never parses; parsing happens lazily in [`Decoder::decode_message`]
/// and consumes nothing until a full message is buffered. The same total bytes
/// fed in any chunking yield the identical sequence of decoded messages.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// Returns `Ok(None)` when no complete message is buffered yet. Errors
    /// are framing corruption and fatal to the connection the bytes came from.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        Message::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
