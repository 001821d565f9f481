//! Manifold Core - Strongly-typed identifiers and configuration for Manifold.
//!
//! Manifold is a fetch-side client core for Kafka-protocol brokers: many
//! logical consumers share a bounded set of physical broker connections.
//! This crate provides the shared value types the other crates build on.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up NodeId with PartitionId
//! - **Explicit limits**: Every resource has a bounded maximum
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod limits;
mod record;
mod types;

pub use error::{Error, KafkaErrorCode, Result};
pub use limits::Limits;
pub use record::{Headers, Record, RecordHeader};
pub use types::{AttachId, ConnectionId, CorrelationId, NodeId, Offset, PartitionId, SinkId};
