//! Manifold Fetch - the connection scheduler and fetch coordinator.
//!
//! One [`FetchPool`] multiplexes every attached consumer over a bounded
//! set of physical broker connections: at most one live, one historical,
//! and one metadata connection per broker, each with at most one request
//! in flight. The pool is single-threaded and performs no background
//! work; callers drive it with transport events and explicit time.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cache;
mod connection;
mod error;
mod pool;
mod topic;
mod transport;
mod wire;

pub use cache::{CacheWrite, NullTopicCache, TopicCache};
pub use connection::{Connection, ConnectionKind, ConnectionState};
pub use error::FetchError;
pub use pool::{AttachSpec, CacheFactory, FetchPool, FetchPoolConfig, ProgressFn};
pub use topic::FetchTopic;
pub use transport::Transport;
pub use wire::{
    read_frame, split_correlation, DescribeConfigsRequest, DescribeConfigsResponse, FetchCodec,
    FetchRequest, FetchRequestPartition, FetchRequestTopic, FetchResponse, FetchResponsePartition,
    FetchResponseTopic, KafkaRequest, KafkaResponse, ListOffsetsRequest,
    ListOffsetsRequestPartition, ListOffsetsRequestTopic, ListOffsetsResponse,
    ListOffsetsResponsePartition, ListOffsetsResponseTopic, MetadataRequest, MetadataResponse,
    MetadataResponseTopic, API_KEY_DESCRIBE_CONFIGS, API_KEY_FETCH, API_KEY_LIST_OFFSETS,
    API_KEY_METADATA, API_VERSION_DESCRIBE_CONFIGS, API_VERSION_FETCH, API_VERSION_LIST_OFFSETS,
    API_VERSION_METADATA, FRAME_HEADER_SIZE, TIMESTAMP_EARLIEST, TIMESTAMP_LATEST,
};
