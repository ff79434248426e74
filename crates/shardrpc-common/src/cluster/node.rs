use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::protocol::error::{Result, ShardRpcError};

/// A member of the cluster.
///
/// `partition_ids` declares which partitions the node serves.
/// `capability` is a bitmask of dynamic features the node currently offers;
/// `persistent_capability` a bitmask of static features. A request may
/// require a mask that must be a subset of the node's corresponding mask.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub id: u32,
    /// Connectable address in `host:port` form
    pub url: String,
    pub partition_ids: BTreeSet<u32>,
    pub capability: u64,
    pub persistent_capability: u64,
}

impl Node {
    /// Creates a node with empty capability masks.
    pub fn new(id: u32, url: impl Into<String>, partition_ids: impl IntoIterator<Item = u32>) -> Self {
        Node {
            id,
            url: url.into(),
            partition_ids: partition_ids.into_iter().collect(),
            capability: 0,
            persistent_capability: 0,
        }
    }

    /// Sets the dynamic capability mask.
    pub fn with_capability(mut self, capability: u64) -> Self {
        self.capability = capability;
        self
    }

    /// Sets the static capability mask.
    pub fn with_persistent_capability(mut self, persistent_capability: u64) -> Self {
        self.persistent_capability = persistent_capability;
        self
    }

    /// Checks the node's masks against the required masks.
    ///
    /// A `None` requirement always passes; a `Some(mask)` requirement passes
    /// when every bit of `mask` is set on the node.
    pub fn satisfies(&self, capability: Option<u64>, persistent_capability: Option<u64>) -> bool {
        let dynamic_ok = capability.map_or(true, |mask| self.capability & mask == mask);
        let persistent_ok =
            persistent_capability.map_or(true, |mask| self.persistent_capability & mask == mask);
        dynamic_ok && persistent_ok
    }

    /// The host part of the node's url.
    pub fn host(&self) -> Result<&str> {
        self.split_url().map(|(host, _)| host)
    }

    /// The port part of the node's url.
    pub fn port(&self) -> Result<u16> {
        let (_, port) = self.split_url()?;
        port.parse().map_err(|_| self.bad_url())
    }

    fn split_url(&self) -> Result<(&str, &str)> {
        self.url.rsplit_once(':').ok_or_else(|| self.bad_url())
    }

    fn bad_url(&self) -> ShardRpcError {
        ShardRpcError::InvalidCluster(format!(
            "node {} url '{}' is not in host:port form",
            self.id, self.url
        ))
    }
}

/// A connectable handle to a node together with its health bit.
///
/// Endpoints are created when the cluster reports a node and dropped on
/// node departure; the health bit mutates independently of membership, e.g.
/// from client-observed connection failures.
#[derive(Debug)]
pub struct Endpoint {
    node: Node,
    can_serve: AtomicBool,
}

impl Endpoint {
    /// Wraps a node; endpoints start healthy.
    pub fn new(node: Node) -> Self {
        Endpoint {
            node,
            can_serve: AtomicBool::new(true),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Whether the underlying connection is believed usable.
    pub fn can_serve_requests(&self) -> bool {
        self.can_serve.load(Ordering::Acquire)
    }

    /// Flips the health bit, e.g. after an observed connection failure.
    pub fn set_can_serve_requests(&self, can_serve: bool) {
        self.can_serve.store(can_serve, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_url_parts() {
        let node = Node::new(1, "example.org:9200", [0, 1]);
        assert_eq!(node.host().unwrap(), "example.org");
        assert_eq!(node.port().unwrap(), 9200);
    }

    #[test]
    fn test_node_bad_url() {
        let node = Node::new(1, "no-port", []);
        assert!(node.port().is_err());
        assert!(matches!(node.port().unwrap_err(), ShardRpcError::InvalidCluster(_)));
    }

    #[test]
    fn test_satisfies_no_requirement() {
        let node = Node::new(1, "a:1", []);
        assert!(node.satisfies(None, None));
    }

    #[test]
    fn test_satisfies_capability_subset() {
        let node = Node::new(1, "a:1", []).with_capability(0b1011);
        assert!(node.satisfies(Some(0b0011), None));
        assert!(node.satisfies(Some(0b1011), None));
        assert!(!node.satisfies(Some(0b0100), None));
    }

    #[test]
    fn test_satisfies_checks_both_masks() {
        let node = Node::new(1, "a:1", [])
            .with_capability(0b01)
            .with_persistent_capability(0b10);
        assert!(node.satisfies(Some(0b01), Some(0b10)));
        assert!(!node.satisfies(Some(0b01), Some(0b01)));
        assert!(!node.satisfies(Some(0b10), Some(0b10)));
    }

    #[test]
    fn test_endpoint_health_bit() {
        let endpoint = Endpoint::new(Node::new(1, "a:1", [0]));
        assert!(endpoint.can_serve_requests());
        endpoint.set_can_serve_requests(false);
        assert!(!endpoint.can_serve_requests());
        endpoint.set_can_serve_requests(true);
        assert!(endpoint.can_serve_requests());
    }
}
