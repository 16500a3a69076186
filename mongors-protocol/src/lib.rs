//! # mongors-protocol
//!
//! MongoDB wire protocol for mongors.
//!
//! This crate provides:
//! - The 16-byte little-endian message envelope
//! - Opcode-tagged request and reply types with bit-exact bodies
//! - A stateful stream decoder tolerant of arbitrary TCP fragmentation
//! - Protocol error types
//!
//! Document payloads are opaque pre-encoded BSON byte buffers; this crate
//! frames and forwards them without inspecting their contents.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::Decoder;
pub use error::ProtocolError;
pub use message::{
    DeleteFlags, InsertFlags, Message, MessageBody, Opcode, QueryFlags, Reply, ReplyFlags,
    Request, UpdateFlags,
};

/// Size of the standard message envelope in bytes.
pub const HEADER_SIZE: usize = 16;

/// Default port for a MongoDB server.
pub const DEFAULT_PORT: u16 = 27017;

/// Maximum accepted wire message size (48 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 48 * 1024 * 1024;

/// Default BSON document size limit, used until the server advertises its
/// own `maxBsonObjectSize`.
pub const DEFAULT_MAX_BSON_SIZE: i32 = 16 * 1024 * 1024;
