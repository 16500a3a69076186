//! Connection pool: one logical client over N physical connections.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::factory::ConnectionFactory;
use crate::protocol::Protocol;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A pool of independently reconnecting connections, selected round-robin.
///
/// There is no cross-connection ordering guarantee: with `pool_size > 1`,
/// operations issued in sequence may land on different physical connections
/// and be reordered. Callers that need ordering must serialize through one
/// protocol obtained from [`ConnectionPool::get_protocol`].
pub struct ConnectionPool {
    factories: Vec<ConnectionFactory>,
    /// Round-robin cursor.
    index: AtomicUsize,
    /// Credentials cached per database name, so any connection in the pool
    /// can authenticate itself the first time it serves that database.
    credentials: std::sync::Mutex<HashMap<String, (String, String)>>,
}

impl ConnectionPool {
    /// Creates the pool and starts `pool_size` connection factories. A size
    /// of 0 is treated as 1; the pool always holds at least one connection.
    pub fn new(config: ClientConfig) -> Self {
        let factories = (0..config.pool_size.max(1))
            .map(|_| ConnectionFactory::start(config.clone()))
            .collect();
        Self {
            factories,
            index: AtomicUsize::new(0),
            credentials: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Creates a pool from a `mongodb://` connection URI.
    pub fn from_uri(uri: &str) -> Result<Self, ClientError> {
        Ok(Self::new(ClientConfig::from_uri(uri)?))
    }

    pub fn pool_size(&self) -> usize {
        self.factories.len()
    }

    fn next_factory(&self) -> &ConnectionFactory {
        let index = self.index.fetch_add(1, Ordering::SeqCst) % self.factories.len();
        &self.factories[index]
    }

    /// Returns the next connection's protocol by round-robin, waiting for
    /// that specific factory to become ready when it is not yet connected.
    pub async fn get_protocol(&self) -> Result<Arc<Protocol>, ClientError> {
        let factory = self.next_factory();
        if let Some(protocol) = factory.protocol_if_ready().await {
            return Ok(protocol);
        }
        factory.notify_ready().await
    }

    /// Runs the MONGODB-CR challenge for `db` on the next connection and
    /// caches the credential so other connections can authenticate
    /// themselves transparently later.
    pub async fn authenticate(
        &self,
        db: &str,
        user: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        let protocol = self.get_protocol().await?;
        protocol.authenticate(db, user, password).await?;
        protocol.mark_authenticated(db);
        self.credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(db.to_string(), (user.to_string(), password.to_string()));
        Ok(())
    }

    /// Like [`ConnectionPool::get_protocol`], but guarantees the returned
    /// connection has authenticated against `db`, running the cached
    /// credential's challenge on it first if needed.
    pub async fn get_authenticated_protocol(
        &self,
        db: &str,
    ) -> Result<Arc<Protocol>, ClientError> {
        let protocol = self.get_protocol().await?;
        if protocol.is_authenticated(db) {
            return Ok(protocol);
        }

        let (user, password) = self
            .credentials
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(db)
            .cloned()
            .ok_or_else(|| ClientError::NoCredential(db.to_string()))?;
        protocol.authenticate(db, &user, &password).await?;
        protocol.mark_authenticated(db);
        Ok(protocol)
    }

    /// Stops every factory's retry behavior and closes every live socket.
    /// In-flight requests fail with a connection-lost error.
    pub async fn disconnect(&self) {
        for factory in &self.factories {
            factory.shutdown().await;
        }
    }
}
