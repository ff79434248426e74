use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::cluster::node::Node;
use crate::protocol::error::{Result, ShardRpcError};

/// Membership events delivered by the coordinator to registered listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// Coordinator session established; carries the current node set
    Connected(Vec<Node>),
    /// Node set or node metadata changed
    NodesChanged(Vec<Node>),
    /// Coordinator session lost; a `Connected` follows on recovery
    Disconnected,
    /// Coordinator is shutting the cluster down
    Shutdown,
}

/// Handle returned by [`ClusterClient::add_listener`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

/// Receiver of cluster events.
///
/// Listeners are invoked on coordinator callback threads: implementations
/// must be short and must not take locks shared with the I/O or worker
/// pools.
pub trait ClusterListener: Send + Sync {
    fn on_event(&self, event: ClusterEvent);
}

impl<F> ClusterListener for F
where
    F: Fn(ClusterEvent) + Send + Sync,
{
    fn on_event(&self, event: ClusterEvent) {
        self(event)
    }
}

/// The observable interface of the cluster coordinator.
///
/// The real coordinator (a ZooKeeper-like store) lives outside this
/// workspace; servers and clients depend only on this trait and receive an
/// implementation as an explicit collaborator.
pub trait ClusterClient: Send + Sync {
    /// Starts the coordinator session.
    fn start(&self) -> Result<()>;

    /// Blocks until the session is established or the timeout elapses.
    fn await_connection(&self, timeout: Duration) -> Result<()>;

    /// Looks up a node by its cluster id.
    fn node_by_id(&self, id: u32) -> Option<Node>;

    /// Looks up a node by its advertised `host:port` url.
    fn node_by_url(&self, host: &str, port: u16) -> Option<Node>;

    /// Marks the node available with the given dynamic capability mask.
    fn mark_node_available(&self, id: u32, capability: u64) -> Result<()>;

    /// Marks the node unavailable.
    fn mark_node_unavailable(&self, id: u32) -> Result<()>;

    /// Replaces the node's dynamic capability mask.
    fn set_node_capability(&self, id: u32, capability: u64) -> Result<()>;

    /// Registers a listener; if the session is already established, the
    /// listener observes a `Connected` immediately.
    fn add_listener(&self, listener: Arc<dyn ClusterListener>) -> ListenerKey;

    /// Deregisters a listener; returns whether the key was known.
    fn remove_listener(&self, key: ListenerKey) -> bool;
}

/// One coordinator call recorded by [`StaticClusterClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityChange {
    Available { node_id: u32, capability: u64 },
    Unavailable { node_id: u32 },
    Capability { node_id: u32, capability: u64 },
}

/// In-process coordinator over a fixed node set.
///
/// Serves two purposes: single-process clusters that need no external
/// coordinator, and swap tests that inject a fake. Every availability call
/// is recorded and can be asserted on; [`StaticClusterClient::fire`] lets
/// tests deliver arbitrary membership events.
pub struct StaticClusterClient {
    nodes: Mutex<HashMap<u32, Node>>,
    listeners: Mutex<HashMap<ListenerKey, Arc<dyn ClusterListener>>>,
    next_key: AtomicU64,
    connected: AtomicBool,
    failing: AtomicBool,
    availability: Mutex<Vec<AvailabilityChange>>,
}

impl StaticClusterClient {
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        StaticClusterClient {
            nodes: Mutex::new(nodes.into_iter().map(|n| (n.id, n)).collect()),
            listeners: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            availability: Mutex::new(Vec::new()),
        }
    }

    /// Current node set, in id order.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.lock().unwrap().values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Delivers an event to every registered listener.
    pub fn fire(&self, event: ClusterEvent) {
        let listeners: Vec<Arc<dyn ClusterListener>> =
            self.listeners.lock().unwrap().values().cloned().collect();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }

    /// Makes subsequent coordinator calls fail with `ClusterUnavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// The availability calls observed so far, in order.
    pub fn availability_changes(&self) -> Vec<AvailabilityChange> {
        self.availability.lock().unwrap().clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ShardRpcError::ClusterUnavailable(
                "static coordinator set to failing".to_string(),
            ));
        }
        Ok(())
    }

    fn record(&self, change: AvailabilityChange) {
        self.availability.lock().unwrap().push(change);
    }
}

impl ClusterClient for StaticClusterClient {
    fn start(&self) -> Result<()> {
        self.check_reachable()?;
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!(nodes = self.nodes.lock().unwrap().len(), "static coordinator connected");
            self.fire(ClusterEvent::Connected(self.nodes()));
        }
        Ok(())
    }

    fn await_connection(&self, timeout: Duration) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ShardRpcError::ClusterUnavailable(format!(
                "not connected after {timeout:?}"
            )))
        }
    }

    fn node_by_id(&self, id: u32) -> Option<Node> {
        self.nodes.lock().unwrap().get(&id).cloned()
    }

    fn node_by_url(&self, host: &str, port: u16) -> Option<Node> {
        let url = format!("{host}:{port}");
        self.nodes
            .lock()
            .unwrap()
            .values()
            .find(|n| n.url == url)
            .cloned()
    }

    fn mark_node_available(&self, id: u32, capability: u64) -> Result<()> {
        self.check_reachable()?;
        if let Some(node) = self.nodes.lock().unwrap().get_mut(&id) {
            node.capability = capability;
        }
        self.record(AvailabilityChange::Available {
            node_id: id,
            capability,
        });
        Ok(())
    }

    fn mark_node_unavailable(&self, id: u32) -> Result<()> {
        self.check_reachable()?;
        self.record(AvailabilityChange::Unavailable { node_id: id });
        Ok(())
    }

    fn set_node_capability(&self, id: u32, capability: u64) -> Result<()> {
        self.check_reachable()?;
        if let Some(node) = self.nodes.lock().unwrap().get_mut(&id) {
            node.capability = capability;
        }
        self.record(AvailabilityChange::Capability {
            node_id: id,
            capability,
        });
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn ClusterListener>) -> ListenerKey {
        let key = ListenerKey(self.next_key.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().unwrap().insert(key, listener.clone());
        if self.connected.load(Ordering::SeqCst) {
            listener.on_event(ClusterEvent::Connected(self.nodes()));
        }
        key
    }

    fn remove_listener(&self, key: ListenerKey) -> bool {
        self.listeners.lock().unwrap().remove(&key).is_some()
    }
}
