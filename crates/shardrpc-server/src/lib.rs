//! ShardRPC Network Server
//!
//! The server side of the ShardRPC framework: a long-running TCP server
//! that accepts length-framed binary requests, dispatches them to
//! registered handlers on a bounded worker pool with per-request deadlines,
//! and keeps its availability synchronized with the cluster coordinator so
//! peers can route partitioned requests to it.
//!
//! # Components
//!
//! - [`ServerConfig`] - the full configuration surface with framework
//!   defaults
//! - [`HandlerRegistry`] - message name to handler mapping, with pluggable
//!   payload codecs
//! - [`Filter`] / filter chain - ordered interceptors around each handler
//!   invocation
//! - [`MessageExecutor`] - the bounded worker pool with queue- and
//!   service-deadline enforcement
//! - [`NetworkServer`] - bind/availability lifecycle and graceful drain
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use shardrpc_common::cluster::{ClusterClient, Node, StaticClusterClient};
//! use shardrpc_server::{NetworkServer, ServerConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> shardrpc_common::Result<()> {
//! let cluster = Arc::new(StaticClusterClient::new(vec![
//!     Node::new(1, "127.0.0.1:9200", [0, 1]),
//! ]));
//! cluster.start()?;
//!
//! let server = NetworkServer::new(ServerConfig::default(), cluster)?;
//! server.register_raw_handler("echo", |payload| Ok(Bytes::copy_from_slice(payload)));
//! server.bind(1, true, 0).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod executor;
pub mod filter;
mod pipeline;
pub mod registry;
pub mod server;

pub use config::ServerConfig;
pub use context::RequestContext;
pub use executor::{CompletionFn, ExecutorResult, MessageExecutor};
pub use filter::{Filter, FilterChain};
pub use registry::{HandlerFailure, HandlerRegistry, JsonCodec, MessageCodec};
pub use server::NetworkServer;
