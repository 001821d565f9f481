//! Manifold Metadata - cluster topology and per-topic metadata state.
//!
//! Tracks which broker leads which partition, each topic's configuration
//! (compaction, retention), and the retry state machine that re-fetches
//! metadata with bounded backoff when brokers move or errors come back.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod backoff;
mod broker;
mod catalog;

pub use backoff::Backoff;
pub use broker::{BrokerChange, BrokerMetadata, BrokerRegistry};
pub use catalog::{
    MetadataOutcome, MetadataRequestKind, MetadataState, TopicLeaders, TopicMetadata,
    TopicMetadataCatalog, DEFAULT_DELETE_RETENTION_MS,
};
