//! ShardRPC Common Types, Wire Format, and Cluster Model
//!
//! This crate provides the protocol definitions, binary wire format, and
//! cluster membership model shared by all ShardRPC components.
//!
//! # Overview
//!
//! ShardRPC is a partitioned RPC framework: servers register handlers for
//! named binary messages and advertise the partitions they serve to a
//! cluster coordinator; clients route each request to a node responsible
//! for the request's partition. This crate contains the pieces both sides
//! agree on:
//!
//! - **Protocol Layer**: the request envelope, its status codes, the error
//!   type, and the tagged binary encoding used on the wire
//! - **Transport Framing**: length-prefixed frame reader/writer over TCP
//! - **Cluster Model**: nodes, endpoints, coordinator events, and the
//!   [`cluster::ClusterClient`] interface every coordinator implementation
//!   exposes
//!
//! # Wire Format
//!
//! Every message is `[4-byte length prefix as u32 big-endian] + [envelope
//! bytes]`. The envelope itself is a sequence of tagged fields; see
//! [`protocol::wire`] for the exact layout.
//!
//! # Example
//!
//! ```
//! use shardrpc_common::protocol::{RequestEnvelope, Status};
//! use bytes::Bytes;
//!
//! // Create a request and the matching reply
//! let request = RequestEnvelope::request(0x0123, "echo", Bytes::from_static(b"hi"));
//! let reply = request.reply(request.payload.clone());
//!
//! assert_eq!(reply.request_id(), request.request_id());
//! assert_eq!(reply.status, Status::Ok);
//! ```

pub mod cluster;
pub mod protocol;

pub use cluster::{ClusterClient, ClusterEvent, Endpoint, Node};
pub use protocol::{RequestEnvelope, Result, ShardRpcError, Status};
