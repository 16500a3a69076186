//! Connection lifecycle management.
//!
//! A [`ConnectionFactory`] owns one logical connection: it walks the combined
//! node list (configured nodes plus nodes discovered from a live replica-set
//! member), connects, runs the `isMaster` configuration step, and publishes
//! the resulting [`Protocol`]. On any failure it advances to the next host,
//! wrapping to the front with a capped-exponential delay once the whole list
//! has been tried. A periodic timer re-runs the configuration step on the
//! live connection to pick up replica-set membership changes.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::protocol::Protocol;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Connection state, published for observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryState {
    Disconnected,
    Connecting,
    Configuring,
    Ready,
    Reconnecting,
}

/// Waiters and the cached ready protocol.
struct ReadySlot {
    protocol: Option<Arc<Protocol>>,
    /// Set on a permanent failure (configuration error or shutdown); rejects
    /// current and future waiters.
    fatal: Option<ClientError>,
    waiters: Vec<oneshot::Sender<Result<Arc<Protocol>, ClientError>>>,
}

struct FactoryShared {
    config: ClientConfig,
    /// Nodes learned from a live node's `isMaster.hosts`.
    discovered: std::sync::Mutex<Vec<String>>,
    ready: Mutex<ReadySlot>,
    state_tx: watch::Sender<FactoryState>,
}

impl FactoryShared {
    fn set_state(&self, state: FactoryState) {
        let _ = self.state_tx.send(state);
    }

    /// Combined node list: configured nodes first, discovered nodes after.
    fn nodes(&self) -> Vec<String> {
        let mut nodes = self.config.hosts.clone();
        let discovered = self
            .discovered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for node in discovered {
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        }
        nodes
    }

    /// Publishes a ready protocol and resolves every queued waiter.
    async fn publish(&self, protocol: Arc<Protocol>) {
        let mut slot = self.ready.lock().await;
        slot.protocol = Some(protocol.clone());
        for tx in slot.waiters.drain(..) {
            let _ = tx.send(Ok(protocol.clone()));
        }
        self.set_state(FactoryState::Ready);
    }

    /// Clears the published protocol after connection death.
    async fn unpublish(&self) {
        self.ready.lock().await.protocol = None;
    }

    /// Rejects every current and future waiter; the factory is done.
    async fn fail_permanently(&self, error: ClientError) {
        let mut slot = self.ready.lock().await;
        slot.protocol = None;
        for tx in slot.waiters.drain(..) {
            let _ = tx.send(Err(clone_error(&error)));
        }
        slot.fatal = Some(error);
        self.set_state(FactoryState::Disconnected);
    }
}

// ClientError is not Clone (it carries io::Error); waiters each get an
// equivalent error built from the original.
fn clone_error(error: &ClientError) -> ClientError {
    match error {
        ClientError::Configuration(message) => ClientError::Configuration(message.clone()),
        ClientError::NotConnected => ClientError::NotConnected,
        _ => ClientError::ConnectionClosed,
    }
}

/// Manages one logical connection, reconnecting across the node list.
pub struct ConnectionFactory {
    shared: Arc<FactoryShared>,
    state_rx: watch::Receiver<FactoryState>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionFactory {
    /// Creates the factory and starts its connector task.
    pub fn start(config: ClientConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(FactoryState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(FactoryShared {
            config,
            discovered: std::sync::Mutex::new(Vec::new()),
            ready: Mutex::new(ReadySlot {
                protocol: None,
                fatal: None,
                waiters: Vec::new(),
            }),
            state_tx,
        });

        let task = tokio::spawn(connector_task(shared.clone(), shutdown_rx));
        Self {
            shared,
            state_rx,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> FactoryState {
        *self.state_rx.borrow()
    }

    /// Returns the ready protocol without waiting, if there is one.
    pub async fn protocol_if_ready(&self) -> Option<Arc<Protocol>> {
        let slot = self.shared.ready.lock().await;
        slot.protocol
            .as_ref()
            .filter(|protocol| !protocol.is_closed())
            .cloned()
    }

    /// Resolves with the ready protocol, waiting for the connector if the
    /// connection is not up yet. Fails only on permanent errors (replica-set
    /// misconfiguration, shutdown).
    pub async fn notify_ready(&self) -> Result<Arc<Protocol>, ClientError> {
        let rx = {
            let mut slot = self.shared.ready.lock().await;
            if let Some(protocol) = slot.protocol.as_ref().filter(|p| !p.is_closed()) {
                return Ok(protocol.clone());
            }
            if let Some(fatal) = &slot.fatal {
                return Err(clone_error(fatal));
            }
            let (tx, rx) = oneshot::channel();
            slot.waiters.push(tx);
            rx
        };
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Nodes currently known beyond the configured list.
    pub fn discovered_nodes(&self) -> Vec<String> {
        self.shared
            .discovered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stops reconnecting, closes the live socket, and fails waiters.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.shared.fail_permanently(ClientError::NotConnected).await;
    }
}

/// One connection attempt: TCP connect, spawn the read loop, run the
/// configuration step. On error the socket is torn down before returning.
async fn attempt(
    shared: &Arc<FactoryShared>,
    host: &str,
) -> Result<(Arc<Protocol>, JoinHandle<()>), ClientError> {
    shared.set_state(FactoryState::Connecting);
    tracing::debug!(host, "connecting");

    let stream = tokio::time::timeout(shared.config.connect_timeout, TcpStream::connect(host))
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(ClientError::Io)?;
    stream.set_nodelay(true).ok();

    let (read_half, write_half) = stream.into_split();
    let protocol = Arc::new(Protocol::new(
        write_half,
        shared.config.write_concern.clone(),
        shared.config.slave_ok,
    ));

    let read_protocol = protocol.clone();
    let read_task = tokio::spawn(async move {
        let _ = read_protocol.read_loop(read_half).await;
    });

    // With slave reads allowed the connection is usable as-is; otherwise it
    // must prove itself a writable master first.
    if !shared.config.slave_ok {
        shared.set_state(FactoryState::Configuring);
        if let Err(err) = configure(shared, &protocol).await {
            protocol.close().await;
            read_task.abort();
            let _ = read_task.await;
            return Err(err);
        }
    }

    Ok((protocol, read_task))
}

/// The `isMaster` configuration step, run on connect and on every periodic
/// topology refresh.
async fn configure(shared: &Arc<FactoryShared>, protocol: &Arc<Protocol>) -> Result<(), ClientError> {
    let reply = protocol
        .run_command("admin", bson::doc! {"isMaster": 1})
        .await?;

    if let Some(expected) = &shared.config.replica_set {
        match reply.get_str("setName") {
            Ok(name) if name == expected => {}
            Ok(name) => {
                return Err(ClientError::Configuration(format!(
                    "replica set name mismatch: requested {expected:?}, server is in {name:?}"
                )));
            }
            Err(_) => {
                return Err(ClientError::Configuration(format!(
                    "requested replica set {expected:?} but server is not in one"
                )));
            }
        }
    }

    if let Ok(size) = reply.get_i32("maxBsonObjectSize") {
        protocol.set_max_bson_size(size);
    }

    if let Ok(hosts) = reply.get_array("hosts") {
        let nodes: Vec<String> = hosts
            .iter()
            .filter_map(|host| host.as_str().map(|s| s.to_string()))
            .collect();
        if !nodes.is_empty() {
            tracing::debug!(?nodes, "discovered replica set members");
            *shared.discovered.lock().unwrap_or_else(|e| e.into_inner()) = nodes;
        }
    }

    // With slave reads allowed a secondary is acceptable, both at connect
    // time and on every later refresh.
    if !shared.config.slave_ok && !reply.get_bool("ismaster").unwrap_or(false) {
        return Err(ClientError::AutoReconnect(
            "node is not master".to_string(),
        ));
    }

    Ok(())
}

/// The connector task: retry loop over the node list plus supervision of the
/// live connection (read loop exit, periodic refresh, shutdown).
async fn connector_task(shared: Arc<FactoryShared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut node_index = 0usize;
    let mut cycle_delay = shared.config.initial_retry_delay;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let nodes = shared.nodes();
        if node_index >= nodes.len() {
            // Whole list exhausted: wrap to the front after a delay that
            // doubles per cycle up to the configured cap.
            node_index = 0;
            tracing::debug!(delay = ?cycle_delay, "node list exhausted, backing off");
            tokio::select! {
                _ = tokio::time::sleep(cycle_delay) => {}
                _ = shutdown_rx.changed() => return,
            }
            cycle_delay = (cycle_delay * 2).min(shared.config.max_retry_delay);
            continue;
        }
        let host = nodes[node_index].clone();
        node_index += 1;

        let (protocol, mut read_task) = match attempt(&shared, &host).await {
            Ok(connected) => connected,
            Err(ClientError::Configuration(message)) => {
                tracing::warn!(host, %message, "configuration error, giving up");
                shared
                    .fail_permanently(ClientError::Configuration(message))
                    .await;
                return;
            }
            Err(err) => {
                tracing::debug!(host, %err, "connection attempt failed");
                shared.set_state(FactoryState::Reconnecting);
                continue;
            }
        };

        tracing::debug!(host, "connection ready");
        shared.publish(protocol.clone()).await;
        node_index = 0;
        cycle_delay = shared.config.initial_retry_delay;

        // Supervise the live connection.
        loop {
            tokio::select! {
                _ = &mut read_task => {
                    tracing::debug!(host, "connection lost");
                    break;
                }
                _ = tokio::time::sleep(shared.config.refresh_interval) => {
                    if let Err(err) = configure(&shared, &protocol).await {
                        if let ClientError::Configuration(message) = err {
                            tracing::warn!(host, %message, "configuration error on refresh");
                            protocol.close().await;
                            read_task.abort();
                            let _ = read_task.await;
                            shared
                                .fail_permanently(ClientError::Configuration(message))
                                .await;
                            return;
                        }
                        tracing::debug!(host, %err, "topology refresh failed");
                        protocol.close().await;
                        read_task.abort();
                        let _ = read_task.await;
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    protocol.close().await;
                    read_task.abort();
                    let _ = read_task.await;
                    return;
                }
            }
        }

        shared.unpublish().await;
        shared.set_state(FactoryState::Reconnecting);
    }
}
