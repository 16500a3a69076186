//! Per-connection request dispatch and reply correlation.
//!
//! One [`Protocol`] exists per live TCP connection. It assigns monotonically
//! increasing request ids, writes framed requests, and routes inbound replies
//! back to the pending caller through a request-id table. The table is the
//! single owner of every pending result: an entry is resolved exactly once,
//! either by a matching reply or by connection loss.

use crate::config::WriteConcern;
use crate::error::ClientError;
use bson::{Bson, Document};
use bytes::Bytes;
use mongors_protocol::{Decoder, QueryFlags, Reply, Request, DEFAULT_MAX_BSON_SIZE};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, Mutex};

/// Read buffer size for socket reads (8 KiB).
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Server error code for "not master".
const NOT_MASTER: i32 = 13435;

/// Server error code for duplicate key violations.
const DUPLICATE_KEY: i32 = 11000;

type PendingSender = oneshot::Sender<Result<Reply, ClientError>>;

/// One connection's protocol engine.
pub struct Protocol {
    /// Write half of the socket.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Pending requests keyed by request id.
    pending: Mutex<HashMap<i32, PendingSender>>,
    /// Next request id; wraps from `i32::MAX` back to 1.
    next_id: AtomicI32,
    /// Negotiated maximum BSON document size.
    max_bson_size: AtomicI32,
    /// Write concern applied by `get_last_error`.
    write_concern: WriteConcern,
    /// Whether to set the slave-ok flag on queries this engine issues itself.
    slave_ok: bool,
    /// Databases this physical connection has authenticated against.
    authenticated: std::sync::Mutex<HashSet<String>>,
    /// Set once the connection is torn down; rejects further sends.
    closed: AtomicBool,
}

impl Protocol {
    pub fn new(writer: OwnedWriteHalf, write_concern: WriteConcern, slave_ok: bool) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(1),
            max_bson_size: AtomicI32::new(DEFAULT_MAX_BSON_SIZE),
            write_concern,
            slave_ok,
            authenticated: std::sync::Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocates the next request id, wrapping to 1 before exceeding
    /// `i32::MAX`.
    fn next_request_id(&self) -> i32 {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(advance_request_id(id))
            })
            .unwrap_or(1)
    }

    /// Negotiated maximum BSON document size for this connection.
    pub fn max_bson_size(&self) -> i32 {
        self.max_bson_size.load(Ordering::SeqCst)
    }

    pub(crate) fn set_max_bson_size(&self, size: i32) {
        self.max_bson_size.store(size, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether this connection already authenticated against `db`.
    pub fn is_authenticated(&self, db: &str) -> bool {
        self.authenticated.lock().unwrap_or_else(|e| e.into_inner()).contains(db)
    }

    pub(crate) fn mark_authenticated(&self, db: &str) {
        self.authenticated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(db.to_string());
    }

    fn check_document_sizes(&self, request: &Request) -> Result<(), ClientError> {
        let max = self.max_bson_size();
        for document in request.documents() {
            if document.len() > max as usize {
                return Err(ClientError::DocumentTooLarge {
                    size: document.len(),
                    max,
                });
            }
        }
        Ok(())
    }

    async fn write_frame(&self, request_id: i32, request: Request) -> Result<(), ClientError> {
        let encoded = mongors_protocol::Message::request(request_id, request).encode()?;
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(&encoded).await.map_err(ClientError::Io)?;
        Ok(())
    }

    /// Sends a fire-and-forget request (insert, update, delete, killCursors,
    /// msg). Pair with [`Protocol::get_last_error`] for acknowledged writes.
    pub async fn send(&self, request: Request) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::NotConnected);
        }
        self.check_document_sizes(&request)?;
        debug_assert!(!request.expects_reply());
        let request_id = self.next_request_id();
        self.write_frame(request_id, request).await
    }

    /// Sends a request that expects a reply (query, getmore) and waits for
    /// the correlated `OP_REPLY`. There is no per-request timeout: the call
    /// pends until the server replies or the connection dies.
    pub async fn send_query(&self, request: Request) -> Result<Reply, ClientError> {
        if self.is_closed() {
            return Err(ClientError::NotConnected);
        }
        self.check_document_sizes(&request)?;
        let request_id = self.next_request_id();

        // Register before writing: the reply may race the send completing.
        let (tx, rx) = oneshot::channel();
        let prior = self.pending.lock().await.insert(request_id, tx);
        debug_assert!(
            prior.is_none(),
            "request id {request_id} reused while still pending"
        );

        if let Err(err) = self.write_frame(request_id, request).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }
        tracing::debug!("request id={} sent, waiting for reply", request_id);

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Runs a command document against `db.$cmd` and returns the single
    /// reply document.
    pub async fn run_command(&self, db: &str, command: Document) -> Result<Document, ClientError> {
        let mut encoded = Vec::new();
        command
            .to_writer(&mut encoded)
            .map_err(|e| ClientError::MalformedDocument(e.to_string()))?;

        let flags = if self.slave_ok {
            QueryFlags::new().with_slave_ok()
        } else {
            QueryFlags::new()
        };
        let reply = self
            .send_query(Request::Query {
                flags,
                full_collection_name: format!("{db}.$cmd"),
                number_to_skip: 0,
                number_to_return: -1,
                query: Bytes::from(encoded),
                fields: None,
            })
            .await?;

        let document = reply
            .documents
            .first()
            .ok_or_else(|| ClientError::MalformedDocument("empty command reply".to_string()))?;
        parse_document(document)
    }

    /// Issues `getlasterror` against `db` with this connection's write
    /// concern and interprets the acknowledgment.
    pub async fn get_last_error(&self, db: &str) -> Result<Document, ClientError> {
        let command = self.write_concern.to_last_error_command();
        let document = self.run_command(db, command).await?;
        check_last_error(document)
    }

    /// Runs the MONGODB-CR nonce challenge against `db` on this connection.
    pub async fn authenticate(
        &self,
        db: &str,
        user: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        let nonce_reply = self.run_command(db, bson::doc! {"getnonce": 1}).await?;
        let nonce = nonce_reply
            .get_str("nonce")
            .map_err(|_| ClientError::MalformedDocument("getnonce reply without nonce".to_string()))?
            .to_string();

        let key = crate::auth::auth_key(&nonce, user, password);
        let reply = self
            .run_command(
                db,
                bson::doc! {
                    "authenticate": 1,
                    "user": user,
                    "nonce": nonce,
                    "key": key,
                },
            )
            .await?;

        if !document_ok(&reply) {
            let message = reply
                .get_str("errmsg")
                .unwrap_or("authentication failed")
                .to_string();
            return Err(ClientError::OperationFailure {
                code: document_code(&reply),
                message,
            });
        }
        tracing::debug!(db, user, "authenticated");
        Ok(())
    }

    /// Reads and dispatches replies until the connection dies, then fails
    /// every remaining pending request with a connection-lost error.
    pub async fn read_loop(&self, mut reader: OwnedReadHalf) -> Result<(), ClientError> {
        let result = self.read_messages(&mut reader).await;
        if let Err(err) = &result {
            tracing::debug!("read loop ended: {err}");
        }
        self.close().await;
        result
    }

    async fn read_messages(&self, reader: &mut OwnedReadHalf) -> Result<(), ClientError> {
        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = reader.read(&mut buf).await.map_err(ClientError::Io)?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            decoder.extend(&buf[..n]);

            while let Some(message) = decoder.decode_message()? {
                match message.body {
                    mongors_protocol::MessageBody::Reply(reply) => {
                        self.dispatch_reply(message.response_to, reply).await?;
                    }
                    mongors_protocol::MessageBody::Request(request) => {
                        // A server never sends requests; the stream is broken.
                        return Err(ClientError::UnexpectedMessage(request.opcode()));
                    }
                }
            }
        }
    }

    /// Routes one reply to its pending caller.
    ///
    /// A reply with no matching entry is dropped: the caller was already
    /// resolved, e.g. by connection loss on a previous incarnation.
    async fn dispatch_reply(&self, response_to: i32, reply: Reply) -> Result<(), ClientError> {
        let Some(tx) = self.pending.lock().await.remove(&response_to) else {
            tracing::debug!("dropping reply with no pending request id={}", response_to);
            return Ok(());
        };

        if reply.response_flags.is_query_failure() {
            match query_failure_error(&reply) {
                // A stale master must not serve further requests: resolve
                // this caller, then tear the connection down.
                ClientError::AutoReconnect(message) => {
                    let _ = tx.send(Err(ClientError::AutoReconnect(message.clone())));
                    return Err(ClientError::AutoReconnect(message));
                }
                error => {
                    let _ = tx.send(Err(error));
                    return Ok(());
                }
            }
        }

        let _ = tx.send(Ok(reply));
        Ok(())
    }

    /// Fails every pending request with a connection-lost error and clears
    /// the table. Senders are consumed on use, so no entry resolves twice.
    async fn fail_all(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            tracing::debug!("failing {} pending requests", pending.len());
        }
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
    }

    /// Tears the connection down: rejects further sends, shuts down the
    /// socket, and fails all pending requests.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.fail_all().await;
    }

    /// Number of requests currently awaiting replies.
    pub fn pending_count(&self) -> usize {
        self.pending.try_lock().map(|p| p.len()).unwrap_or(0)
    }
}

fn advance_request_id(id: i32) -> i32 {
    if id == i32::MAX {
        1
    } else {
        id + 1
    }
}

/// Maps a query-failure reply to the error observed by its caller.
fn query_failure_error(reply: &Reply) -> ClientError {
    let document = match reply.documents.first().map(|d| parse_document(d)) {
        Some(Ok(document)) => document,
        _ => {
            return ClientError::OperationFailure {
                code: None,
                message: "query failure without error document".to_string(),
            }
        }
    };

    let code = document_code(&document);
    let message = document
        .get_str("$err")
        .or_else(|_| document.get_str("err"))
        .unwrap_or("query failure")
        .to_string();

    if code == Some(NOT_MASTER) {
        ClientError::AutoReconnect(message)
    } else {
        ClientError::OperationFailure { code, message }
    }
}

/// Interprets a `getlasterror` acknowledgment document.
pub(crate) fn check_last_error(document: Document) -> Result<Document, ClientError> {
    // On success the server reports err as null, not absent.
    let message = match document.get("err") {
        Some(Bson::String(message)) => message.clone(),
        _ => return Ok(document),
    };

    let code = document_code(&document);
    if code == Some(DUPLICATE_KEY) {
        return Err(ClientError::DuplicateKey {
            code: DUPLICATE_KEY,
            message,
        });
    }
    Err(ClientError::OperationFailure { code, message })
}

pub(crate) fn parse_document(raw: &Bytes) -> Result<Document, ClientError> {
    Document::from_reader(&mut raw.as_ref())
        .map_err(|e| ClientError::MalformedDocument(e.to_string()))
}

/// Reads a numeric `code` field regardless of its BSON integer width.
pub(crate) fn document_code(document: &Document) -> Option<i32> {
    match document.get("code") {
        Some(Bson::Int32(code)) => Some(*code),
        Some(Bson::Int64(code)) => Some(*code as i32),
        Some(Bson::Double(code)) => Some(*code as i32),
        _ => None,
    }
}

/// Whether a command reply's `ok` field signals success.
pub(crate) fn document_ok(document: &Document) -> bool {
    match document.get("ok") {
        Some(Bson::Double(ok)) => *ok != 0.0,
        Some(Bson::Int32(ok)) => *ok != 0,
        Some(Bson::Int64(ok)) => *ok != 0,
        Some(Bson::Boolean(ok)) => *ok,
        _ => false,
    }
}
