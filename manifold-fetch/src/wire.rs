//! Decoded request/response shapes and response framing.
//!
//! The byte layout of the Kafka protocol is the codec collaborator's
//! business; the pool works entirely in these decoded value types. Only
//! the outermost framing (length prefix, correlation id) is handled
//! here, because it gates when a response is complete.
//!
//! # Wire Format
//!
//! ```text
//! ┌─────────────────┬──────────────────┬───────────────────────────────┐
//! │  Length (4B)    │ Correlation (4B) │          Body                 │
//! │   big-endian    │    big-endian    │  decoded by the codec         │
//! └─────────────────┴──────────────────┴───────────────────────────────┘
//! ```

use bytes::{Buf, Bytes, BytesMut};
use manifold_core::{CorrelationId, KafkaErrorCode, NodeId, Offset, PartitionId, Record};
use manifold_metadata::BrokerMetadata;

use crate::error::FetchError;

/// Fetch API key.
pub const API_KEY_FETCH: i16 = 1;
/// ListOffsets API key.
pub const API_KEY_LIST_OFFSETS: i16 = 2;
/// Metadata API key.
pub const API_KEY_METADATA: i16 = 3;
/// DescribeConfigs API key.
pub const API_KEY_DESCRIBE_CONFIGS: i16 = 32;

/// Fetch API version spoken by this core.
pub const API_VERSION_FETCH: i16 = 5;
/// ListOffsets API version spoken by this core.
pub const API_VERSION_LIST_OFFSETS: i16 = 2;
/// Metadata API version spoken by this core.
pub const API_VERSION_METADATA: i16 = 5;
/// DescribeConfigs API version spoken by this core.
pub const API_VERSION_DESCRIBE_CONFIGS: i16 = 0;

/// ListOffsets timestamp meaning "the next offset to be written".
pub const TIMESTAMP_LATEST: i64 = -1;
/// ListOffsets timestamp meaning "the earliest retained offset".
pub const TIMESTAMP_EARLIEST: i64 = -2;

/// Bytes of the length prefix on every frame.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Reads one length-prefixed frame from the buffer.
///
/// Returns `None` until a full frame has accumulated; the caller keeps
/// the partial bytes and retries on the next data event.
///
/// # Errors
/// Fails if the advertised length exceeds `max_frame_bytes`.
pub fn read_frame(buf: &mut BytesMut, max_frame_bytes: u32) -> Result<Option<Bytes>, FetchError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    // Peek at the length without consuming it.
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > max_frame_bytes as usize {
        return Err(FetchError::FrameTooLarge {
            length: length as u64,
            max: max_frame_bytes,
        });
    }

    let total = FRAME_HEADER_SIZE + length;
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_SIZE);
    Ok(Some(buf.split_to(length).freeze()))
}

/// Splits a frame payload into its correlation id and body.
///
/// # Errors
/// Fails if the frame is shorter than the response header.
pub fn split_correlation(mut frame: Bytes) -> Result<(CorrelationId, Bytes), FetchError> {
    if frame.len() < 4 {
        return Err(FetchError::TruncatedFrame { length: frame.len() });
    }
    let correlation = frame.get_u32();
    Ok((CorrelationId::new(u64::from(correlation)), frame))
}

// ---- Requests ----

/// A request the pool wants encoded and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaRequest {
    /// Metadata v5.
    Metadata(MetadataRequest),
    /// DescribeConfigs v0.
    DescribeConfigs(DescribeConfigsRequest),
    /// ListOffsets v2.
    ListOffsets(ListOffsetsRequest),
    /// Fetch v5.
    Fetch(FetchRequest),
}

impl KafkaRequest {
    /// The request's API key.
    #[must_use]
    pub const fn api_key(&self) -> i16 {
        match self {
            Self::Metadata(_) => API_KEY_METADATA,
            Self::DescribeConfigs(_) => API_KEY_DESCRIBE_CONFIGS,
            Self::ListOffsets(_) => API_KEY_LIST_OFFSETS,
            Self::Fetch(_) => API_KEY_FETCH,
        }
    }

    /// The fixed API version this core speaks for the request.
    #[must_use]
    pub const fn api_version(&self) -> i16 {
        match self {
            Self::Metadata(_) => API_VERSION_METADATA,
            Self::DescribeConfigs(_) => API_VERSION_DESCRIBE_CONFIGS,
            Self::ListOffsets(_) => API_VERSION_LIST_OFFSETS,
            Self::Fetch(_) => API_VERSION_FETCH,
        }
    }
}

/// Topics whose leaders we need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequest {
    /// Topic names to resolve.
    pub topics: Vec<String>,
}

/// Compaction and retention configs for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeConfigsRequest {
    /// Topic to describe. The codec asks for `cleanup.policy` and
    /// `delete.retention.ms`.
    pub topic: String,
}

/// Offset resolution round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsRequest {
    /// Per-topic partition queries.
    pub topics: Vec<ListOffsetsRequestTopic>,
}

/// One topic's partition queries within a list-offsets request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsRequestTopic {
    /// Topic name.
    pub topic: String,
    /// Queried partitions.
    pub partitions: Vec<ListOffsetsRequestPartition>,
}

/// One partition query within a list-offsets request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOffsetsRequestPartition {
    /// Partition to query.
    pub partition: PartitionId,
    /// [`TIMESTAMP_LATEST`] or [`TIMESTAMP_EARLIEST`].
    pub timestamp: i64,
}

/// A fetch round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Maximum time the broker may hold the request, in milliseconds.
    pub max_wait_ms: u32,
    /// Minimum bytes the broker should accumulate before responding.
    pub min_bytes: u32,
    /// Maximum bytes across the whole response.
    pub max_bytes: u32,
    /// Per-topic partition fetches.
    pub topics: Vec<FetchRequestTopic>,
}

impl FetchRequest {
    /// The offset this request asked for on one partition, if included.
    #[must_use]
    pub fn requested_offset(&self, topic: &str, partition: PartitionId) -> Option<Offset> {
        self.topics
            .iter()
            .find(|t| t.topic == topic)?
            .partitions
            .iter()
            .find(|p| p.partition == partition)
            .map(|p| p.fetch_offset)
    }
}

/// One topic's slice of a fetch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequestTopic {
    /// Topic name.
    pub topic: String,
    /// Partitions fetched from this topic.
    pub partitions: Vec<FetchRequestPartition>,
}

/// One partition's slice of a fetch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequestPartition {
    /// Partition to fetch.
    pub partition: PartitionId,
    /// Offset to fetch from.
    pub fetch_offset: Offset,
    /// Byte budget for this partition.
    pub partition_max_bytes: u32,
}

// ---- Responses ----

/// A decoded response handed back by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaResponse {
    /// Metadata v5.
    Metadata(MetadataResponse),
    /// DescribeConfigs v0.
    DescribeConfigs(DescribeConfigsResponse),
    /// ListOffsets v2.
    ListOffsets(ListOffsetsResponse),
    /// Fetch v5.
    Fetch(FetchResponse),
}

/// Cluster topology plus per-topic leader assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponse {
    /// Every broker the cluster advertised.
    pub brokers: Vec<BrokerMetadata>,
    /// Requested topics.
    pub topics: Vec<MetadataResponseTopic>,
}

/// One topic's slice of a metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponseTopic {
    /// Topic name.
    pub topic: String,
    /// Topic-level error code.
    pub error: KafkaErrorCode,
    /// Leader per partition index; `None` when unknown.
    pub leaders: Vec<Option<NodeId>>,
}

/// Compaction and retention configs for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeConfigsResponse {
    /// Topic name.
    pub topic: String,
    /// Resource-level error code.
    pub error: KafkaErrorCode,
    /// True when `cleanup.policy` contains `compact`.
    pub compacted: bool,
    /// `delete.retention.ms`, when the broker reported it.
    pub delete_retention_ms: Option<u64>,
}

/// Resolved offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsResponse {
    /// Per-topic partition results.
    pub topics: Vec<ListOffsetsResponseTopic>,
}

/// One topic's slice of a list-offsets response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsResponseTopic {
    /// Topic name.
    pub topic: String,
    /// Queried partitions.
    pub partitions: Vec<ListOffsetsResponsePartition>,
}

/// One partition's resolved offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOffsetsResponsePartition {
    /// Partition queried.
    pub partition: PartitionId,
    /// Partition-level error code.
    pub error: KafkaErrorCode,
    /// The timestamp that was queried, echoing the request.
    pub timestamp: i64,
    /// The resolved offset.
    pub offset: Offset,
}

/// Decoded records per topic-partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    /// Per-topic partition results.
    pub topics: Vec<FetchResponseTopic>,
}

/// One topic's slice of a fetch response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponseTopic {
    /// Topic name.
    pub topic: String,
    /// Fetched partitions.
    pub partitions: Vec<FetchResponsePartition>,
}

/// One partition's slice of a fetch response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponsePartition {
    /// Partition fetched.
    pub partition: PartitionId,
    /// Partition-level error code.
    pub error: KafkaErrorCode,
    /// The broker's high-water mark for the partition.
    pub high_watermark: Offset,
    /// The broker's earliest retained offset.
    pub log_start_offset: Offset,
    /// Decoded records, in offset order.
    pub records: Vec<Record>,
}

/// The wire codec seam.
///
/// Implementations own the byte layout of the four APIs this core
/// speaks. `decode` receives the originating request so it knows the
/// API key, version, and partition order without re-parsing state.
pub trait FetchCodec {
    /// Encodes a request into a complete frame payload (request header
    /// included, length prefix included).
    ///
    /// # Errors
    /// Fails if the request cannot be represented at the fixed version.
    fn encode(
        &mut self,
        correlation: CorrelationId,
        request: &KafkaRequest,
    ) -> Result<Bytes, FetchError>;

    /// Decodes a response body (frame payload minus the correlation id).
    ///
    /// # Errors
    /// Fails on malformed bytes; the pool treats this as a connection
    /// failure.
    fn decode(
        &mut self,
        request: &KafkaRequest,
        correlation: CorrelationId,
        body: Bytes,
    ) -> Result<KafkaResponse, FetchError>;
}
