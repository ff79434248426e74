//! ShardRPC Protocol Layer
//!
//! Defines the request envelope exchanged between peers, the error type
//! visible to framework callers, and the binary wire codec.
//!
//! # Components
//!
//! - [`envelope`] - [`RequestEnvelope`] and [`Status`]
//! - [`error`] - [`ShardRpcError`] and the crate-wide [`Result`] alias
//! - [`wire`] - tagged binary envelope codec and length-prefixed framing

pub mod envelope;
pub mod error;
pub mod wire;

pub use envelope::{RequestEnvelope, Status};
pub use error::{Result, ShardRpcError};
