//! Wire message types for the MongoDB binary protocol.
//!
//! Every message starts with the standard 16-byte envelope:
//!
//! ```text
//! +----------------+-----------+------------+--------+
//! | messageLength  | requestId | responseTo | opCode |
//! |    int32       |   int32   |   int32    | int32  |
//! +----------------+-----------+------------+--------+
//! | opcode-specific body                             |
//! +--------------------------------------------------+
//! ```
//!
//! All integers are little-endian and `messageLength` includes the envelope
//! itself. Document payloads are opaque pre-encoded BSON buffers: the first
//! four bytes of a BSON document are its own little-endian length, which is
//! all this crate ever reads from one.

use crate::error::ProtocolError;
use crate::{HEADER_SIZE, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Opcode values as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    Reply = 1,
    Msg = 1000,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl Opcode {
    pub fn from_i32(value: i32) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(Opcode::Reply),
            1000 => Ok(Opcode::Msg),
            2001 => Ok(Opcode::Update),
            2002 => Ok(Opcode::Insert),
            2004 => Ok(Opcode::Query),
            2005 => Ok(Opcode::GetMore),
            2006 => Ok(Opcode::Delete),
            2007 => Ok(Opcode::KillCursors),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Query flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlags(i32);

impl QueryFlags {
    pub const TAILABLE_CURSOR: i32 = 1 << 1;
    /// Allow reads from secondaries.
    pub const SLAVE_OK: i32 = 1 << 2;
    pub const NO_CURSOR_TIMEOUT: i32 = 1 << 4;
    pub const AWAIT_DATA: i32 = 1 << 5;
    pub const EXHAUST: i32 = 1 << 6;
    pub const PARTIAL: i32 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_slave_ok(mut self) -> Self {
        self.0 |= Self::SLAVE_OK;
        self
    }

    pub fn with_tailable_cursor(mut self) -> Self {
        self.0 |= Self::TAILABLE_CURSOR;
        self
    }

    pub fn with_await_data(mut self) -> Self {
        self.0 |= Self::AWAIT_DATA;
        self
    }

    pub fn is_slave_ok(&self) -> bool {
        self.0 & Self::SLAVE_OK != 0
    }

    pub fn bits(&self) -> i32 {
        self.0
    }

    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }
}

/// Reply flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyFlags(i32);

impl ReplyFlags {
    pub const CURSOR_NOT_FOUND: i32 = 1 << 0;
    pub const QUERY_FAILURE: i32 = 1 << 1;
    pub const SHARD_CONFIG_STALE: i32 = 1 << 2;
    pub const AWAIT_CAPABLE: i32 = 1 << 3;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_query_failure(mut self) -> Self {
        self.0 |= Self::QUERY_FAILURE;
        self
    }

    pub fn with_cursor_not_found(mut self) -> Self {
        self.0 |= Self::CURSOR_NOT_FOUND;
        self
    }

    pub fn is_query_failure(&self) -> bool {
        self.0 & Self::QUERY_FAILURE != 0
    }

    pub fn is_cursor_not_found(&self) -> bool {
        self.0 & Self::CURSOR_NOT_FOUND != 0
    }

    pub fn bits(&self) -> i32 {
        self.0
    }

    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }
}

/// Insert flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertFlags(i32);

impl InsertFlags {
    pub const CONTINUE_ON_ERROR: i32 = 1 << 0;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_continue_on_error(mut self) -> Self {
        self.0 |= Self::CONTINUE_ON_ERROR;
        self
    }

    pub fn bits(&self) -> i32 {
        self.0
    }

    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }
}

/// Update flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateFlags(i32);

impl UpdateFlags {
    pub const UPSERT: i32 = 1 << 0;
    pub const MULTI_UPDATE: i32 = 1 << 1;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_upsert(mut self) -> Self {
        self.0 |= Self::UPSERT;
        self
    }

    pub fn with_multi_update(mut self) -> Self {
        self.0 |= Self::MULTI_UPDATE;
        self
    }

    pub fn bits(&self) -> i32 {
        self.0
    }

    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }
}

/// Delete flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteFlags(i32);

impl DeleteFlags {
    pub const SINGLE_REMOVE: i32 = 1 << 0;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_single_remove(mut self) -> Self {
        self.0 |= Self::SINGLE_REMOVE;
        self
    }

    pub fn bits(&self) -> i32 {
        self.0
    }

    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }
}

/// A request message body, tagged by opcode.
///
/// Documents (`query`, `selector`, `update`, entries of `documents`) are
/// opaque pre-encoded BSON buffers supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Query {
        flags: QueryFlags,
        full_collection_name: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: Bytes,
        fields: Option<Bytes>,
    },
    Insert {
        flags: InsertFlags,
        full_collection_name: String,
        documents: Vec<Bytes>,
    },
    Update {
        full_collection_name: String,
        flags: UpdateFlags,
        selector: Bytes,
        update: Bytes,
    },
    Delete {
        full_collection_name: String,
        flags: DeleteFlags,
        selector: Bytes,
    },
    GetMore {
        full_collection_name: String,
        number_to_return: i32,
        cursor_id: i64,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
    Msg {
        message: String,
    },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Query { .. } => Opcode::Query,
            Request::Insert { .. } => Opcode::Insert,
            Request::Update { .. } => Opcode::Update,
            Request::Delete { .. } => Opcode::Delete,
            Request::GetMore { .. } => Opcode::GetMore,
            Request::KillCursors { .. } => Opcode::KillCursors,
            Request::Msg { .. } => Opcode::Msg,
        }
    }

    /// Whether the server answers this request kind with an `OP_REPLY`.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Request::Query { .. } | Request::GetMore { .. })
    }

    /// Borrows every document buffer carried by this request.
    pub fn documents(&self) -> Vec<&Bytes> {
        match self {
            Request::Query { query, fields, .. } => {
                let mut documents = vec![query];
                if let Some(fields) = fields {
                    documents.push(fields);
                }
                documents
            }
            Request::Insert { documents, .. } => documents.iter().collect(),
            Request::Update {
                selector, update, ..
            } => vec![selector, update],
            Request::Delete { selector, .. } => vec![selector],
            Request::GetMore { .. } | Request::KillCursors { .. } | Request::Msg { .. } => {
                Vec::new()
            }
        }
    }
}

/// An `OP_REPLY` message body.
///
/// `numberReturned` is implicit: it is always `documents.len()` and the
/// decoder enforces that equality.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub response_flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Bytes>,
}

/// A decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Request(Request),
    Reply(Reply),
}

impl MessageBody {
    pub fn opcode(&self) -> Opcode {
        match self {
            MessageBody::Request(request) => request.opcode(),
            MessageBody::Reply(_) => Opcode::Reply,
        }
    }
}

/// A complete wire message: envelope fields plus typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub request_id: i32,
    pub response_to: i32,
    pub body: MessageBody,
}

impl Message {
    pub fn request(request_id: i32, request: Request) -> Self {
        Self {
            request_id,
            response_to: 0,
            body: MessageBody::Request(request),
        }
    }

    pub fn reply(request_id: i32, response_to: i32, reply: Reply) -> Self {
        Self {
            request_id,
            response_to,
            body: MessageBody::Reply(reply),
        }
    }

    /// Encodes the message into bytes, envelope included.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut body = BytesMut::with_capacity(64);
        encode_body(&self.body, &mut body)?;

        let message_length = HEADER_SIZE + body.len();
        if message_length > MAX_MESSAGE_SIZE as usize {
            return Err(ProtocolError::MessageTooLarge {
                size: message_length as u32,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(message_length);
        buf.put_i32_le(message_length as i32);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.body.opcode() as i32);
        buf.put_slice(&body);
        Ok(buf)
    }

    /// Decodes a message from the front of `buf`.
    ///
    /// Returns `Ok(Some(message))` if a complete message was decoded,
    /// `Ok(None)` if more data is needed (the buffer is left untouched so a
    /// later call can retry), or `Err` on framing corruption.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the envelope without consuming.
        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if message_length < HEADER_SIZE as i32 {
            return Err(ProtocolError::InvalidMessageLength(message_length));
        }
        if message_length as u32 > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: message_length as u32,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if buf.len() < message_length as usize {
            return Ok(None);
        }

        let mut frame = buf.split_to(message_length as usize).freeze();
        frame.advance(4); // messageLength, already validated
        let request_id = frame.get_i32_le();
        let response_to = frame.get_i32_le();
        let opcode = Opcode::from_i32(frame.get_i32_le())?;
        let body = decode_body(opcode, frame)?;

        Ok(Some(Self {
            request_id,
            response_to,
            body,
        }))
    }
}

fn encode_body(body: &MessageBody, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    match body {
        MessageBody::Request(Request::Query {
            flags,
            full_collection_name,
            number_to_skip,
            number_to_return,
            query,
            fields,
        }) => {
            buf.put_i32_le(flags.bits());
            put_cstring(buf, full_collection_name)?;
            buf.put_i32_le(*number_to_skip);
            buf.put_i32_le(*number_to_return);
            buf.put_slice(query);
            if let Some(fields) = fields {
                buf.put_slice(fields);
            }
        }
        MessageBody::Request(Request::Insert {
            flags,
            full_collection_name,
            documents,
        }) => {
            buf.put_i32_le(flags.bits());
            put_cstring(buf, full_collection_name)?;
            for document in documents {
                buf.put_slice(document);
            }
        }
        MessageBody::Request(Request::Update {
            full_collection_name,
            flags,
            selector,
            update,
        }) => {
            buf.put_i32_le(0); // reserved
            put_cstring(buf, full_collection_name)?;
            buf.put_i32_le(flags.bits());
            buf.put_slice(selector);
            buf.put_slice(update);
        }
        MessageBody::Request(Request::Delete {
            full_collection_name,
            flags,
            selector,
        }) => {
            buf.put_i32_le(0); // reserved
            put_cstring(buf, full_collection_name)?;
            buf.put_i32_le(flags.bits());
            buf.put_slice(selector);
        }
        MessageBody::Request(Request::GetMore {
            full_collection_name,
            number_to_return,
            cursor_id,
        }) => {
            buf.put_i32_le(0); // reserved
            put_cstring(buf, full_collection_name)?;
            buf.put_i32_le(*number_to_return);
            buf.put_i64_le(*cursor_id);
        }
        MessageBody::Request(Request::KillCursors { cursor_ids }) => {
            buf.put_i32_le(0); // reserved
            buf.put_i32_le(cursor_ids.len() as i32);
            for cursor_id in cursor_ids {
                buf.put_i64_le(*cursor_id);
            }
        }
        MessageBody::Request(Request::Msg { message }) => {
            put_cstring(buf, message)?;
        }
        MessageBody::Reply(Reply {
            response_flags,
            cursor_id,
            starting_from,
            documents,
        }) => {
            buf.put_i32_le(response_flags.bits());
            buf.put_i64_le(*cursor_id);
            buf.put_i32_le(*starting_from);
            buf.put_i32_le(documents.len() as i32);
            for document in documents {
                buf.put_slice(document);
            }
        }
    }
    Ok(())
}

fn decode_body(opcode: Opcode, mut body: Bytes) -> Result<MessageBody, ProtocolError> {
    let decoded = match opcode {
        Opcode::Reply => {
            let response_flags = ReplyFlags::from_bits(get_i32(&mut body, "responseFlags")?);
            let cursor_id = get_i64(&mut body, "cursorId")?;
            let starting_from = get_i32(&mut body, "startingFrom")?;
            let number_returned = get_i32(&mut body, "numberReturned")?;
            // The count is peer-controlled; cap the pre-allocation.
            let mut documents = Vec::with_capacity((number_returned.max(0) as usize).min(64));
            for _ in 0..number_returned {
                match get_document(&mut body) {
                    Ok(document) => documents.push(document),
                    Err(ProtocolError::Truncated(_)) => {
                        return Err(ProtocolError::DocumentCountMismatch {
                            expected: number_returned,
                            actual: documents.len(),
                        })
                    }
                    Err(err) => return Err(err),
                }
            }
            MessageBody::Reply(Reply {
                response_flags,
                cursor_id,
                starting_from,
                documents,
            })
        }
        Opcode::Query => {
            let flags = QueryFlags::from_bits(get_i32(&mut body, "flags")?);
            let full_collection_name = get_cstring(&mut body)?;
            let number_to_skip = get_i32(&mut body, "numberToSkip")?;
            let number_to_return = get_i32(&mut body, "numberToReturn")?;
            let query = get_document(&mut body)?;
            let fields = if body.is_empty() {
                None
            } else {
                Some(get_document(&mut body)?)
            };
            MessageBody::Request(Request::Query {
                flags,
                full_collection_name,
                number_to_skip,
                number_to_return,
                query,
                fields,
            })
        }
        Opcode::Insert => {
            let flags = InsertFlags::from_bits(get_i32(&mut body, "flags")?);
            let full_collection_name = get_cstring(&mut body)?;
            let mut documents = Vec::new();
            while !body.is_empty() {
                documents.push(get_document(&mut body)?);
            }
            MessageBody::Request(Request::Insert {
                flags,
                full_collection_name,
                documents,
            })
        }
        Opcode::Update => {
            skip_reserved(&mut body)?;
            let full_collection_name = get_cstring(&mut body)?;
            let flags = UpdateFlags::from_bits(get_i32(&mut body, "flags")?);
            let selector = get_document(&mut body)?;
            let update = get_document(&mut body)?;
            MessageBody::Request(Request::Update {
                full_collection_name,
                flags,
                selector,
                update,
            })
        }
        Opcode::Delete => {
            skip_reserved(&mut body)?;
            let full_collection_name = get_cstring(&mut body)?;
            let flags = DeleteFlags::from_bits(get_i32(&mut body, "flags")?);
            let selector = get_document(&mut body)?;
            MessageBody::Request(Request::Delete {
                full_collection_name,
                flags,
                selector,
            })
        }
        Opcode::GetMore => {
            skip_reserved(&mut body)?;
            let full_collection_name = get_cstring(&mut body)?;
            let number_to_return = get_i32(&mut body, "numberToReturn")?;
            let cursor_id = get_i64(&mut body, "cursorId")?;
            MessageBody::Request(Request::GetMore {
                full_collection_name,
                number_to_return,
                cursor_id,
            })
        }
        Opcode::KillCursors => {
            skip_reserved(&mut body)?;
            let count = get_i32(&mut body, "numberOfCursorIds")?;
            let mut cursor_ids = Vec::with_capacity((count.max(0) as usize).min(64));
            for _ in 0..count {
                cursor_ids.push(get_i64(&mut body, "cursorId")?);
            }
            MessageBody::Request(Request::KillCursors { cursor_ids })
        }
        Opcode::Msg => {
            let message = get_cstring(&mut body)?;
            MessageBody::Request(Request::Msg { message })
        }
    };

    if !body.is_empty() {
        return Err(ProtocolError::TrailingBytes(body.len()));
    }
    Ok(decoded)
}

fn put_cstring(buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    if value.as_bytes().contains(&0) {
        return Err(ProtocolError::InteriorNul);
    }
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn get_cstring(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::Truncated("cstring"))?;
    let raw = buf.split_to(nul);
    buf.advance(1); // the NUL itself
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn get_i32(buf: &mut Bytes, field: &'static str) -> Result<i32, ProtocolError> {
    if buf.len() < 4 {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(buf.get_i32_le())
}

fn get_i64(buf: &mut Bytes, field: &'static str) -> Result<i64, ProtocolError> {
    if buf.len() < 8 {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(buf.get_i64_le())
}

fn skip_reserved(buf: &mut Bytes) -> Result<(), ProtocolError> {
    get_i32(buf, "reserved").map(|_| ())
}

/// Slices one opaque BSON document off the front of `buf`.
///
/// Only the document's own 4-byte length prefix is interpreted; contents are
/// never inspected.
fn get_document(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    if buf.len() < 4 {
        return Err(ProtocolError::Truncated("document"));
    }
    let length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    // A BSON document is at least its length prefix plus the trailing NUL.
    if length < 5 {
        return Err(ProtocolError::InvalidDocumentLength(length));
    }
    if buf.len() < length as usize {
        return Err(ProtocolError::Truncated("document"));
    }
    Ok(buf.split_to(length as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: &[(&str, i32)]) -> Bytes {
        let mut document = bson::Document::new();
        for (key, value) in pairs {
            document.insert(key.to_string(), *value);
        }
        let mut out = Vec::new();
        document.to_writer(&mut out).unwrap();
        Bytes::from(out)
    }

    fn roundtrip(message: Message) {
        let mut encoded = message.encode().unwrap();
        let decoded = Message::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_query_roundtrip() {
        roundtrip(Message::request(
            7,
            Request::Query {
                flags: QueryFlags::new().with_slave_ok(),
                full_collection_name: "db.coll".to_string(),
                number_to_skip: 5,
                number_to_return: 10,
                query: doc(&[("x", 1)]),
                fields: Some(doc(&[("y", 1)])),
            },
        ));
    }

    #[test]
    fn test_query_without_fields_roundtrip() {
        roundtrip(Message::request(
            8,
            Request::Query {
                flags: QueryFlags::new(),
                full_collection_name: "db.$cmd".to_string(),
                number_to_skip: 0,
                number_to_return: -1,
                query: doc(&[("ismaster", 1)]),
                fields: None,
            },
        ));
    }

    #[test]
    fn test_insert_roundtrip() {
        roundtrip(Message::request(
            1,
            Request::Insert {
                flags: InsertFlags::new().with_continue_on_error(),
                full_collection_name: "db.coll".to_string(),
                documents: vec![doc(&[("a", 1)]), doc(&[("b", 2)]), doc(&[("c", 3)])],
            },
        ));
    }

    #[test]
    fn test_update_roundtrip() {
        roundtrip(Message::request(
            2,
            Request::Update {
                full_collection_name: "db.coll".to_string(),
                flags: UpdateFlags::new().with_upsert().with_multi_update(),
                selector: doc(&[("a", 1)]),
                update: doc(&[("a", 2)]),
            },
        ));
    }

    #[test]
    fn test_delete_roundtrip() {
        roundtrip(Message::request(
            3,
            Request::Delete {
                full_collection_name: "db.coll".to_string(),
                flags: DeleteFlags::new().with_single_remove(),
                selector: doc(&[("a", 1)]),
            },
        ));
    }

    #[test]
    fn test_getmore_roundtrip() {
        roundtrip(Message::request(
            4,
            Request::GetMore {
                full_collection_name: "db.coll".to_string(),
                number_to_return: 100,
                cursor_id: 0x1122334455667788,
            },
        ));
    }

    #[test]
    fn test_kill_cursors_roundtrip() {
        roundtrip(Message::request(
            5,
            Request::KillCursors {
                cursor_ids: vec![1, -2, i64::MAX],
            },
        ));
    }

    #[test]
    fn test_msg_roundtrip() {
        roundtrip(Message::request(
            6,
            Request::Msg {
                message: "hello".to_string(),
            },
        ));
    }

    #[test]
    fn test_reply_roundtrip() {
        roundtrip(Message::reply(
            99,
            7,
            Reply {
                response_flags: ReplyFlags::new().with_cursor_not_found(),
                cursor_id: 42,
                starting_from: 3,
                documents: vec![doc(&[("ok", 1)]), doc(&[("n", 2)])],
            },
        ));
    }

    #[test]
    fn test_envelope_layout() {
        let message = Message::request(
            0x01020304,
            Request::Msg {
                message: "x".to_string(),
            },
        );
        let encoded = message.encode().unwrap();
        // length = 16 header + "x\0" = 18, little-endian
        assert_eq!(&encoded[0..4], &[18, 0, 0, 0]);
        // requestId little-endian
        assert_eq!(&encoded[4..8], &[0x04, 0x03, 0x02, 0x01]);
        // responseTo
        assert_eq!(&encoded[8..12], &[0, 0, 0, 0]);
        // opcode 1000
        assert_eq!(&encoded[12..16], &[0xe8, 0x03, 0, 0]);
    }

    #[test]
    fn test_length_too_small_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(8); // below the 16-byte minimum
        buf.put_slice(&[0u8; 12]);
        let result = Message::decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidMessageLength(8))
        ));
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(16);
        buf.put_i32_le(1);
        buf.put_i32_le(0);
        buf.put_i32_le(9999);
        let result = Message::decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::UnknownOpcode(9999))));
    }

    #[test]
    fn test_incomplete_header_needs_more() {
        let mut buf = BytesMut::from(&[100u8, 0, 0][..]);
        assert!(Message::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_incomplete_body_leaves_buffer_untouched() {
        let message = Message::request(
            1,
            Request::Msg {
                message: "partial".to_string(),
            },
        );
        let encoded = message.encode().unwrap();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        let before = buf.len();
        assert!(Message::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn test_reply_document_count_mismatch() {
        let mut body = BytesMut::new();
        body.put_i32_le(0); // responseFlags
        body.put_i64_le(0); // cursorId
        body.put_i32_le(0); // startingFrom
        body.put_i32_le(2); // claims two documents
        body.put_slice(&doc(&[("only", 1)]));

        let mut buf = BytesMut::new();
        buf.put_i32_le((HEADER_SIZE + body.len()) as i32);
        buf.put_i32_le(1);
        buf.put_i32_le(1);
        buf.put_i32_le(Opcode::Reply as i32);
        buf.put_slice(&body);

        let result = Message::decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::DocumentCountMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_interior_nul_rejected_on_encode() {
        let message = Message::request(
            1,
            Request::Msg {
                message: "bad\0name".to_string(),
            },
        );
        assert!(matches!(
            message.encode(),
            Err(ProtocolError::InteriorNul)
        ));
    }

    #[test]
    fn test_bad_document_length_rejected() {
        let mut body = BytesMut::new();
        body.put_i32_le(0);
        body.put_slice(b"db.coll\0");
        body.put_i32_le(0);
        body.put_i32_le(0);
        body.put_i32_le(3); // "document" shorter than the BSON minimum
        body.put_slice(&[0u8; 3]);

        let mut buf = BytesMut::new();
        buf.put_i32_le((HEADER_SIZE + body.len()) as i32);
        buf.put_i32_le(1);
        buf.put_i32_le(0);
        buf.put_i32_le(Opcode::Query as i32);
        buf.put_slice(&body);

        let result = Message::decode(&mut buf);
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidDocumentLength(3))
        ));
    }
}
