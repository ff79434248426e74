//! ShardRPC Client-Side Routing
//!
//! The structures a ShardRPC client uses to route a partitioned request to
//! a node that serves the request's partition.
//!
//! # Overview
//!
//! A [`LoadBalancerTable`] is built from the endpoints the cluster
//! currently advertises. For each partition it keeps a rotating cursor over
//! the endpoints that declare the partition, filtered by two health bits
//! (the endpoint's own and a per-route flag) and by the capability masks a
//! request may require. Tables are immutable after construction: when
//! membership changes, the client builds a new table and swaps it whole.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use shardrpc_client::LoadBalancerTable;
//! use shardrpc_common::cluster::{Endpoint, Node};
//!
//! let endpoints = vec![
//!     Arc::new(Endpoint::new(Node::new(1, "10.0.0.1:9200", [0]))),
//!     Arc::new(Endpoint::new(Node::new(2, "10.0.0.2:9200", [0]))),
//! ];
//! let table = LoadBalancerTable::build(endpoints, 1, false).unwrap();
//!
//! let node = table.node_for_partition(0, None, None).unwrap();
//! assert!(node.id == 1 || node.id == 2);
//! ```

mod balancer;

pub use balancer::LoadBalancerTable;
