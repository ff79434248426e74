use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use tracing::warn;

use shardrpc_common::cluster::{Endpoint, Node};
use shardrpc_common::protocol::{Result, ShardRpcError};

/// Rotation state for one partition.
///
/// The cursor deliberately uses 32-bit signed arithmetic so a long-lived
/// route survives counter wrap-around: it is reset at `i32::MAX` before
/// each advance, and the compensation after a scan keeps it non-negative.
/// `states` is a per-route health flag, independent of the endpoint's own
/// `can_serve_requests` bit; an endpoint is usable on this route only when
/// both are true.
#[derive(Debug)]
struct PartitionRoute {
    endpoints: Vec<Arc<Endpoint>>,
    cursor: AtomicI32,
    states: Vec<AtomicBool>,
}

impl PartitionRoute {
    fn new(endpoints: Vec<Arc<Endpoint>>) -> Self {
        let states = endpoints.iter().map(|_| AtomicBool::new(true)).collect();
        PartitionRoute {
            endpoints,
            cursor: AtomicI32::new(0),
            states,
        }
    }

    fn usable(&self, index: usize, capability: Option<u64>, persistent_capability: Option<u64>) -> bool {
        self.states[index].load(Ordering::Acquire)
            && self.endpoints[index].can_serve_requests()
            && self.endpoints[index]
                .node()
                .satisfies(capability, persistent_capability)
    }

    /// Advances the cursor and returns the starting slot for a scan.
    fn advance(&self) -> i32 {
        let _ = self
            .cursor
            .compare_exchange(i32::MAX, 0, Ordering::SeqCst, Ordering::SeqCst);
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        if idx < 0 {
            self.cursor.store(0, Ordering::SeqCst);
            return 0;
        }
        idx
    }

    /// Writes the cursor back after a scan that skipped `skipped` slots.
    fn compensate(&self, idx: i32, skipped: i32) {
        let mut next = idx.wrapping_add(1).wrapping_add(skipped);
        if next < 0 {
            next = next.wrapping_sub(i32::MAX);
        }
        self.cursor.store(next, Ordering::SeqCst);
    }

    fn next_node(&self, capability: Option<u64>, persistent_capability: Option<u64>) -> Node {
        let len = self.endpoints.len();
        let idx = self.advance();
        let start = idx as usize % len;

        for offset in 0..len {
            let slot = (start + offset) % len;
            if self.usable(slot, capability, persistent_capability) {
                self.compensate(idx, offset as i32);
                return self.endpoints[slot].node().clone();
            }
        }

        // Nothing qualifies: hand out the starting slot anyway so the
        // cluster keeps making forward progress; callers observe failure
        // through the RPC itself.
        self.compensate(idx, 0);
        self.endpoints[start].node().clone()
    }

    fn qualifying_nodes(
        &self,
        capability: Option<u64>,
        persistent_capability: Option<u64>,
    ) -> Vec<Node> {
        let len = self.endpoints.len();
        let idx = self.advance();
        let start = idx as usize % len;

        let mut nodes: Vec<Node> = Vec::new();
        for offset in 0..len {
            let slot = (start + offset) % len;
            if self.usable(slot, capability, persistent_capability) {
                let node = self.endpoints[slot].node();
                if !nodes.iter().any(|n| n.id == node.id) {
                    nodes.push(node.clone());
                }
            }
        }
        self.compensate(idx, 0);
        nodes
    }

    fn set_state(&self, node_id: u32, can_serve: bool) -> bool {
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.node().id == node_id {
                self.states[index].store(can_serve, Ordering::Release);
                return true;
            }
        }
        false
    }
}

/// Partition id to rotating endpoint set, the structure a client routes
/// requests through.
///
/// Built once from a membership snapshot; a cluster change produces a new
/// table which replaces the old one whole. The only mutable pieces are the
/// atomic cursors and health flags.
#[derive(Debug)]
pub struct LoadBalancerTable {
    routes: HashMap<u32, PartitionRoute>,
}

impl LoadBalancerTable {
    /// Builds a table over `num_partitions` partitions.
    ///
    /// Endpoints are grouped by every partition their node declares. If no
    /// partition has an endpoint the cluster is unusable and construction
    /// fails; if only some are missing, construction fails unless
    /// `serve_requests_if_partition_missing` allows routing to proceed for
    /// the partitions that are covered.
    pub fn build(
        endpoints: Vec<Arc<Endpoint>>,
        num_partitions: u32,
        serve_requests_if_partition_missing: bool,
    ) -> Result<Self> {
        let mut grouped: HashMap<u32, Vec<Arc<Endpoint>>> = HashMap::new();
        for endpoint in &endpoints {
            for &partition in &endpoint.node().partition_ids {
                grouped.entry(partition).or_default().push(endpoint.clone());
            }
        }

        let missing: Vec<u32> = (0..num_partitions)
            .filter(|partition| !grouped.contains_key(partition))
            .collect();
        if !missing.is_empty() {
            if missing.len() as u32 == num_partitions {
                return Err(ShardRpcError::InvalidCluster(
                    "no endpoint serves any partition".to_string(),
                ));
            }
            if !serve_requests_if_partition_missing {
                return Err(ShardRpcError::InvalidCluster(format!(
                    "partitions {missing:?} have no endpoints"
                )));
            }
            warn!(
                missing = ?missing,
                "continuing without endpoints for some partitions"
            );
        }

        let routes = grouped
            .into_iter()
            .map(|(partition, endpoints)| (partition, PartitionRoute::new(endpoints)))
            .collect();
        Ok(LoadBalancerTable { routes })
    }

    /// Selects a node for the partition, rotating over usable endpoints.
    ///
    /// Returns `None` when the partition has no route at all. When the
    /// partition has endpoints but none currently qualifies, one is
    /// returned regardless (the caller observes failure via the RPC).
    pub fn node_for_partition(
        &self,
        partition_id: u32,
        capability: Option<u64>,
        persistent_capability: Option<u64>,
    ) -> Option<Node> {
        self.routes
            .get(&partition_id)
            .map(|route| route.next_node(capability, persistent_capability))
    }

    /// Every qualifying node for the partition, first-seen order from the
    /// current cursor position, without duplicates.
    pub fn nodes_for_partition(
        &self,
        partition_id: u32,
        capability: Option<u64>,
        persistent_capability: Option<u64>,
    ) -> Vec<Node> {
        self.routes
            .get(&partition_id)
            .map(|route| route.qualifying_nodes(capability, persistent_capability))
            .unwrap_or_default()
    }

    /// Flips the per-route health flag for the node on this partition.
    ///
    /// Returns whether the partition has a route containing the node. The
    /// endpoint's own `can_serve_requests` bit is a separate condition.
    pub fn set_route_state(&self, partition_id: u32, node_id: u32, can_serve: bool) -> bool {
        self.routes
            .get(&partition_id)
            .map(|route| route.set_state(node_id, can_serve))
            .unwrap_or(false)
    }

    /// Number of partitions with at least one endpoint.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}
