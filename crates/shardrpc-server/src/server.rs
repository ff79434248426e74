use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, info, warn};

use shardrpc_common::cluster::{ClusterClient, ClusterEvent, ClusterListener, ListenerKey, Node};
use shardrpc_common::protocol::{Result, ShardRpcError};
use shardrpc_metrics::{RequestStatistics, StatisticsSnapshot};

use crate::config::ServerConfig;
use crate::executor::MessageExecutor;
use crate::filter::Filter;
use crate::pipeline;
use crate::registry::{HandlerFailure, HandlerRegistry, MessageCodec};

/// Lifecycle of a server instance.
enum ServerState {
    Unbound,
    Bound(BoundState),
    ShuttingDown,
    ShutDown,
}

struct BoundState {
    node: Node,
    /// Capability to re-advertise when the coordinator session recovers
    initial_capability: u64,
    /// Whether a `Connected` event should re-mark the node available
    mark_when_connected: bool,
    listener_key: Option<ListenerKey>,
    local_addr: SocketAddr,
    acceptor: tokio::task::JoinHandle<()>,
}

struct ServerInner {
    config: ServerConfig,
    cluster: Arc<dyn ClusterClient>,
    registry: Arc<HandlerRegistry>,
    executor: MessageExecutor,
    stats: Arc<RequestStatistics>,
    state: Mutex<ServerState>,
    shutdown_once: AtomicBool,
}

/// The cluster-aware ShardRPC network server.
///
/// Owns the TCP acceptor, the request dispatcher, and the node's
/// availability in the cluster. Collaborators are injected explicitly: the
/// coordinator arrives as an [`ClusterClient`] trait object so tests can
/// swap in an in-process fake.
///
/// # Lifecycle
///
/// `Unbound → Bound → ShuttingDown → ShutDown`, driven by
/// [`bind`](NetworkServer::bind) and [`shutdown`](NetworkServer::shutdown).
/// A bound server reacts to coordinator events: on session recovery it
/// re-advertises the node's intended availability, and a coordinator
/// `Shutdown` event drains the server without touching the (already gone)
/// coordinator. Shutdown is idempotent.
pub struct NetworkServer {
    inner: Arc<ServerInner>,
}

impl NetworkServer {
    /// Creates a server over the given coordinator.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: ServerConfig, cluster: Arc<dyn ClusterClient>) -> Result<Self> {
        let registry = Arc::new(HandlerRegistry::new());
        let stats = Arc::new(RequestStatistics::new(
            config.service_name.clone(),
            config.client_name.clone(),
            config.request_statistics_window_ms,
        ));
        let executor = MessageExecutor::new(&config, registry.clone(), stats.clone())?;

        Ok(NetworkServer {
            inner: Arc::new(ServerInner {
                config,
                cluster,
                registry,
                executor,
                stats,
                state: Mutex::new(ServerState::Unbound),
                shutdown_once: AtomicBool::new(false),
            }),
        })
    }

    /// Registers a typed handler with explicit payload codecs.
    pub fn register_handler<Req, Res, F>(
        &self,
        message_name: impl Into<String>,
        handler: F,
        input_codec: impl MessageCodec<Req> + 'static,
        output_codec: impl MessageCodec<Res> + 'static,
    ) where
        Req: 'static,
        Res: 'static,
        F: Fn(Req) -> std::result::Result<Res, HandlerFailure> + Send + Sync + 'static,
    {
        self.inner
            .registry
            .register(message_name, handler, input_codec, output_codec);
    }

    /// Registers a handler working directly on payload bytes.
    pub fn register_raw_handler<F>(&self, message_name: impl Into<String>, handler: F)
    where
        F: Fn(&[u8]) -> std::result::Result<Bytes, HandlerFailure> + Send + Sync + 'static,
    {
        self.inner.registry.register_raw(message_name, handler);
    }

    /// Appends filters to the dispatcher's chain.
    pub fn add_filters(&self, filters: Vec<Arc<dyn Filter>>) {
        self.inner.executor.add_filters(filters);
    }

    /// Changes the queue-deadline horizon for subsequent requests.
    pub fn set_request_timeout(&self, millis: u64) {
        self.inner.executor.set_request_timeout(millis);
    }

    pub fn statistics_snapshot(&self) -> StatisticsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Binds as the cluster node with the given id.
    ///
    /// Looks the node up in the coordinator, starts the TCP acceptor on
    /// the node's declared port bound to the wildcard address, and
    /// registers the cluster listener. With `mark_available`, the node is
    /// advertised as available once the coordinator session is (or
    /// becomes) connected.
    pub async fn bind(
        &self,
        node_id: u32,
        mark_available: bool,
        initial_capability: u64,
    ) -> Result<()> {
        let node = self
            .inner
            .cluster
            .node_by_id(node_id)
            .ok_or_else(|| ShardRpcError::InvalidNode(format!("node id {node_id}")))?;
        self.bind_node(node, mark_available, initial_capability).await
    }

    /// Binds as the cluster node advertising `host:port`.
    pub async fn bind_by_url(
        &self,
        host: &str,
        port: u16,
        mark_available: bool,
        initial_capability: u64,
    ) -> Result<()> {
        let node = self
            .inner
            .cluster
            .node_by_url(host, port)
            .ok_or_else(|| ShardRpcError::InvalidNode(format!("url {host}:{port}")))?;
        self.bind_node(node, mark_available, initial_capability).await
    }

    /// Binds as the cluster node advertising the local host name and
    /// `port`.
    pub async fn bind_by_port(
        &self,
        port: u16,
        mark_available: bool,
        initial_capability: u64,
    ) -> Result<()> {
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        self.bind_by_url(&host, port, mark_available, initial_capability).await
    }

    /// Advertises the node as available with the given capability.
    ///
    /// Also arms the reconnect behavior: future `Connected` events
    /// re-advertise this state until [`mark_unavailable`] is called.
    ///
    /// [`mark_unavailable`]: NetworkServer::mark_unavailable
    pub fn mark_available(&self, capability: u64) -> Result<()> {
        let node_id = {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                ServerState::Bound(bound) => {
                    bound.mark_when_connected = true;
                    bound.initial_capability = capability;
                    bound.node.id
                }
                ServerState::Unbound => return Err(ShardRpcError::NotBound),
                _ => return Err(ShardRpcError::NetworkShutdown),
            }
        };
        self.inner.cluster.mark_node_available(node_id, capability)
    }

    /// Advertises the node as unavailable and disarms the reconnect
    /// re-advertisement.
    pub fn mark_unavailable(&self) -> Result<()> {
        let node_id = {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                ServerState::Bound(bound) => {
                    bound.mark_when_connected = false;
                    bound.node.id
                }
                ServerState::Unbound => return Err(ShardRpcError::NotBound),
                _ => return Err(ShardRpcError::NetworkShutdown),
            }
        };
        self.inner.cluster.mark_node_unavailable(node_id)
    }

    /// The address the acceptor is listening on, while bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.inner.state.lock().unwrap() {
            ServerState::Bound(bound) => Some(bound.local_addr),
            _ => None,
        }
    }

    /// The node this server is bound as, while bound.
    pub fn bound_node(&self) -> Option<Node> {
        match &*self.inner.state.lock().unwrap() {
            ServerState::Bound(bound) => Some(bound.node.clone()),
            _ => None,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), ServerState::ShutDown)
    }

    /// Gracefully shuts the server down.
    ///
    /// With a positive `shutdown_pause_multiplier` the node is first
    /// marked unavailable and the task sleeps `multiplier ×
    /// coordinator_session_timeout_ms` so peers observe the departure
    /// before sockets close. The acceptor then stops, the executor drains
    /// (queued-but-unstarted requests complete as rejected, in-flight
    /// handlers finish), and the state becomes `ShutDown`. Calling this
    /// twice has the same observable effect as once.
    pub async fn shutdown(&self) {
        ServerInner::do_shutdown(self.inner.clone(), false).await;
    }

    async fn bind_node(
        &self,
        node: Node,
        mark_available: bool,
        initial_capability: u64,
    ) -> Result<()> {
        {
            let state = self.inner.state.lock().unwrap();
            match &*state {
                ServerState::Unbound => {}
                ServerState::Bound(_) => return Err(ShardRpcError::AlreadyBound),
                _ => return Err(ShardRpcError::NetworkShutdown),
            }
        }

        let port = node.port()?;
        let listener = bind_listener(port)?;
        let local_addr = listener.local_addr().map_err(ShardRpcError::NetworkBind)?;
        let acceptor = tokio::spawn(accept_loop(
            listener,
            self.inner.executor.clone(),
            self.inner.config.avoid_payload_copy,
        ));

        {
            let mut state = self.inner.state.lock().unwrap();
            match &*state {
                ServerState::Unbound => {}
                ServerState::Bound(_) => {
                    drop(state);
                    acceptor.abort();
                    return Err(ShardRpcError::AlreadyBound);
                }
                _ => {
                    drop(state);
                    acceptor.abort();
                    return Err(ShardRpcError::NetworkShutdown);
                }
            }
            *state = ServerState::Bound(BoundState {
                node: node.clone(),
                initial_capability,
                mark_when_connected: mark_available,
                listener_key: None,
                local_addr,
                acceptor,
            });
        }

        // Registered after the state commit: the listener may immediately
        // replay a `Connected`, which reads the bound state.
        let adapter = Arc::new(ClusterEventAdapter {
            server: Arc::downgrade(&self.inner),
            runtime: tokio::runtime::Handle::current(),
        });
        let key = self.inner.cluster.add_listener(adapter);
        if let ServerState::Bound(bound) = &mut *self.inner.state.lock().unwrap() {
            bound.listener_key = Some(key);
        }

        info!(node_id = node.id, %local_addr, "server bound");
        Ok(())
    }
}

impl ServerInner {
    /// Reaction to a coordinator session (re)establishment.
    ///
    /// When the node is meant to be available, it is marked unavailable
    /// and then available again so coordinator watchers observe a
    /// transition even if the availability znode survived the reconnect.
    fn on_coordinator_connected(&self) {
        let armed = {
            let state = self.state.lock().unwrap();
            match &*state {
                ServerState::Bound(bound) if bound.mark_when_connected => {
                    Some((bound.node.id, bound.initial_capability))
                }
                _ => None,
            }
        };
        let Some((node_id, capability)) = armed else {
            return;
        };

        if let Err(e) = self.cluster.mark_node_unavailable(node_id) {
            warn!(error = %e, "failed to clear availability after reconnect");
        }
        if let Err(e) = self.cluster.mark_node_available(node_id, capability) {
            warn!(error = %e, "failed to re-advertise availability after reconnect");
        }
    }

    async fn do_shutdown(inner: Arc<ServerInner>, from_cluster: bool) {
        if inner
            .shutdown_once
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let bound = {
            let mut state = inner.state.lock().unwrap();
            match std::mem::replace(&mut *state, ServerState::ShuttingDown) {
                ServerState::Bound(bound) => Some(bound),
                _ => None,
            }
        };

        if let Some(bound) = bound {
            if !from_cluster {
                if inner.config.shutdown_pause_multiplier > 0 {
                    if let Err(e) = inner.cluster.mark_node_unavailable(bound.node.id) {
                        warn!(error = %e, "failed to mark node unavailable during shutdown");
                    }
                    let pause = Duration::from_millis(
                        u64::from(inner.config.shutdown_pause_multiplier)
                            * inner.config.coordinator_session_timeout_ms,
                    );
                    info!(?pause, "pausing before close so peers observe the departure");
                    tokio::time::sleep(pause).await;
                }
                if let Some(key) = bound.listener_key {
                    inner.cluster.remove_listener(key);
                }
            }
            bound.acceptor.abort();
        }

        let executor = inner.executor.clone();
        let _ = tokio::task::spawn_blocking(move || executor.shutdown()).await;

        *inner.state.lock().unwrap() = ServerState::ShutDown;
        info!("network server shut down");
    }
}

/// Bridges coordinator events onto the server.
///
/// Holds the server weakly: a dropped server silently detaches. Event
/// handlers stay short; the heavy `Shutdown` reaction is spawned onto the
/// runtime rather than run on the coordinator's callback thread.
struct ClusterEventAdapter {
    server: Weak<ServerInner>,
    runtime: tokio::runtime::Handle,
}

impl ClusterListener for ClusterEventAdapter {
    fn on_event(&self, event: ClusterEvent) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        match event {
            ClusterEvent::Connected(_) => server.on_coordinator_connected(),
            ClusterEvent::NodesChanged(_) => debug!("cluster membership changed"),
            ClusterEvent::Disconnected => warn!("coordinator session lost"),
            ClusterEvent::Shutdown => {
                info!("coordinator requested shutdown");
                self.runtime.spawn(async move {
                    ServerInner::do_shutdown(server, true).await;
                });
            }
        }
    }
}

fn bind_listener(port: u16) -> Result<TcpListener> {
    let socket = TcpSocket::new_v4().map_err(ShardRpcError::NetworkBind)?;
    socket.set_reuseaddr(true).map_err(ShardRpcError::NetworkBind)?;
    socket.set_nodelay(true).map_err(ShardRpcError::NetworkBind)?;
    socket
        .bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .map_err(ShardRpcError::NetworkBind)?;
    socket.listen(1024).map_err(ShardRpcError::NetworkBind)
}

async fn accept_loop(listener: TcpListener, executor: MessageExecutor, avoid_payload_copy: bool) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "connection established");
                let executor = executor.clone();
                tokio::spawn(async move {
                    let _ = pipeline::serve_connection(stream, peer, executor, avoid_payload_copy)
                        .await;
                });
            }
            Err(e) => warn!(error = %e, "failed to accept connection"),
        }
    }
}
