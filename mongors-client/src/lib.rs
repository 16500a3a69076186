//! # mongors-client
//!
//! Async MongoDB transport core for mongors.
//!
//! This crate provides:
//! - Per-connection request/reply correlation over the wire protocol
//! - Replica-set-aware connection factories with automatic master discovery
//!   and reconnection
//! - A round-robin connection pool with per-database MONGODB-CR auth
//! - Connection URI parsing and write-concern configuration
//!
//! Collection and database convenience APIs are out of scope: callers build
//! pre-encoded BSON documents and exchange framed requests and replies
//! through [`Protocol`].

pub mod auth;
pub mod config;
pub mod error;
pub mod factory;
pub mod pool;
pub mod protocol;

pub use config::{ClientConfig, WriteConcern};
pub use error::ClientError;
pub use factory::{ConnectionFactory, FactoryState};
pub use pool::ConnectionPool;
pub use protocol::Protocol;
