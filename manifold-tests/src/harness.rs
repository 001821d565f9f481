//! Scripted fakes for driving a [`FetchPool`] deterministically.
//!
//! The transport records everything the pool asks of the network; the
//! codec records every encoded request and serves scripted responses in
//! order. Tests observe cause and effect without any real Kafka broker.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use bytes::Bytes;
use manifold_core::{
    ConnectionId, CorrelationId, Headers, KafkaErrorCode, Limits, NodeId, Offset, PartitionId,
    Record,
};
use manifold_dispatch::{DispatchContext, DispatchFlags, MessageSink, SinkProgress};
use manifold_fetch::{
    CacheFactory, CacheWrite, DescribeConfigsResponse, FetchCodec, FetchError, FetchPool,
    FetchPoolConfig,
    FetchResponse, FetchResponsePartition, FetchResponseTopic, KafkaRequest, KafkaResponse,
    ListOffsetsResponse, ListOffsetsResponsePartition, ListOffsetsResponseTopic,
    MetadataResponse, MetadataResponseTopic, TopicCache, Transport,
};
use manifold_metadata::BrokerMetadata;

/// Everything the pool asked the transport to do.
#[derive(Debug, Default)]
pub struct TransportLog {
    /// Connect attempts, in order.
    pub connects: Vec<ConnectionId>,
    /// Sent frames as `(connection, frame_len)`.
    pub sent: Vec<(ConnectionId, usize)>,
    /// Response-window credits granted.
    pub credits: Vec<(ConnectionId, u32)>,
    /// Aborted connections.
    pub aborted: Vec<ConnectionId>,
    /// Cleanly closed connections.
    pub closed: Vec<ConnectionId>,
}

/// A transport that records operations and always succeeds.
pub struct ScriptedTransport(
    /// Shared log of transport activity.
    pub Rc<RefCell<TransportLog>>,
);

impl Transport for ScriptedTransport {
    fn connect(
        &mut self,
        connection: ConnectionId,
        _broker: &BrokerMetadata,
    ) -> Result<(), FetchError> {
        self.0.borrow_mut().connects.push(connection);
        Ok(())
    }

    fn send(&mut self, connection: ConnectionId, frame: Bytes) -> Result<(), FetchError> {
        self.0.borrow_mut().sent.push((connection, frame.len()));
        Ok(())
    }

    fn credit(&mut self, connection: ConnectionId, bytes: u32) {
        self.0.borrow_mut().credits.push((connection, bytes));
    }

    fn abort(&mut self, connection: ConnectionId) {
        self.0.borrow_mut().aborted.push(connection);
    }

    fn close(&mut self, connection: ConnectionId) {
        self.0.borrow_mut().closed.push(connection);
    }
}

/// Requests the codec saw and responses it is scripted to return.
#[derive(Debug, Default)]
pub struct CodecLog {
    /// Every request encoded, in order.
    pub encoded: Vec<KafkaRequest>,
    /// Responses served to `decode`, front first.
    pub responses: VecDeque<KafkaResponse>,
}

/// A codec whose decode output is scripted by the test.
pub struct ScriptedCodec(
    /// Shared log of codec activity.
    pub Rc<RefCell<CodecLog>>,
);

impl FetchCodec for ScriptedCodec {
    fn encode(
        &mut self,
        _correlation: CorrelationId,
        request: &KafkaRequest,
    ) -> Result<Bytes, FetchError> {
        self.0.borrow_mut().encoded.push(request.clone());
        Ok(Bytes::from_static(&[0u8; 16]))
    }

    fn decode(
        &mut self,
        _request: &KafkaRequest,
        _correlation: CorrelationId,
        _body: Bytes,
    ) -> Result<KafkaResponse, FetchError> {
        self.0
            .borrow_mut()
            .responses
            .pop_front()
            .ok_or_else(|| FetchError::Codec {
                message: "no scripted response".to_string(),
            })
    }
}

/// One delivered record as seen by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Partition the record came from.
    pub partition: PartitionId,
    /// Record offset.
    pub offset: Offset,
    /// Record value bytes, if any.
    pub value: Option<Vec<u8>>,
}

/// Everything a [`RecordingSink`] observed.
#[derive(Debug, Default)]
pub struct SinkLog {
    /// Records delivered through `dispatch`.
    pub received: Vec<Delivered>,
    /// `detached(reattach)` notifications.
    pub detached: Vec<bool>,
}

/// A consumer endpoint that records deliveries and exposes a settable
/// downstream window.
pub struct RecordingSink {
    log: Rc<RefCell<SinkLog>>,
    window: u32,
}

impl RecordingSink {
    /// Creates a sink with an unbounded window.
    #[must_use]
    pub fn new(log: Rc<RefCell<SinkLog>>) -> Self {
        Self {
            log,
            window: u32::MAX,
        }
    }

    /// Creates a sink advertising a fixed downstream window.
    #[must_use]
    pub fn with_window(log: Rc<RefCell<SinkLog>>, window: u32) -> Self {
        Self { log, window }
    }
}

impl MessageSink for RecordingSink {
    fn dispatch(&mut self, ctx: &DispatchContext<'_>) -> DispatchFlags {
        self.log.borrow_mut().received.push(Delivered {
            partition: ctx.partition,
            offset: ctx.message_offset,
            value: ctx.value.map(<[u8]>::to_vec),
        });
        DispatchFlags::MATCHED | DispatchFlags::DELIVERED
    }

    fn flush(
        &mut self,
        _partition: PartitionId,
        _request_offset: Offset,
        _last_offset: Offset,
    ) -> Option<SinkProgress> {
        None
    }

    fn detached(&mut self, reattach: bool) {
        self.log.borrow_mut().detached.push(reattach);
    }

    fn window_bytes(&self) -> u32 {
        self.window
    }
}

/// Progress reports captured from one consumer's progress callback.
pub type ProgressLog = Rc<RefCell<Vec<(PartitionId, Offset, Offset)>>>;

/// Builds a progress callback appending into `log`.
#[must_use]
pub fn progress_fn(log: &ProgressLog) -> Box<dyn FnMut(PartitionId, Offset, Offset)> {
    let log = Rc::clone(log);
    Box::new(move |partition, old, new| log.borrow_mut().push((partition, old, new)))
}

/// Shared in-memory topic cache emulating log compaction.
///
/// Retains the latest record per key; tests hold a clone of the inner
/// state to inspect what the pool cached.
#[derive(Debug, Default, Clone)]
pub struct SharedCache(
    /// Shared cache contents, inspectable by the test.
    pub Rc<RefCell<CacheState>>,
);

/// Inner state of a [`SharedCache`].
#[derive(Debug, Default)]
pub struct CacheState {
    /// Retained records per partition, by offset.
    pub entries: BTreeMap<(PartitionId, Offset), Record>,
    /// First offset past the retained range, per partition.
    pub next_offsets: HashMap<PartitionId, Offset>,
}

impl TopicCache for SharedCache {
    fn add(&mut self, write: &CacheWrite<'_>) {
        let mut state = self.0.borrow_mut();
        if write.cache_if_new {
            // Compaction: drop any earlier entry carrying the same key.
            let stale: Vec<(PartitionId, Offset)> = state
                .entries
                .range((write.partition, Offset::new(0))..=(write.partition, Offset::LIVE))
                .filter(|(_, record)| record.key.as_deref() == write.key)
                .map(|(&at, _)| at)
                .collect();
            for at in stale {
                state.entries.remove(&at);
            }
        }
        let mut headers = Headers::new();
        for header in write.headers.iter() {
            headers.push(header.name.clone(), header.value.clone());
        }
        state.entries.insert(
            (write.partition, write.message_offset),
            Record {
                offset: write.message_offset,
                timestamp: write.timestamp,
                key: write.key.map(Bytes::copy_from_slice),
                headers,
                value: write.value.map(Bytes::copy_from_slice),
            },
        );
    }

    fn entries(
        &self,
        partition: PartitionId,
        from: Offset,
    ) -> Box<dyn Iterator<Item = Record> + '_> {
        let records: Vec<Record> = self
            .0
            .borrow()
            .entries
            .range((partition, from)..=(partition, Offset::LIVE))
            .map(|(_, record)| record.clone())
            .collect();
        Box::new(records.into_iter())
    }

    fn extend_next_offset(
        &mut self,
        partition: PartitionId,
        _request_offset: Offset,
        next_offset: Offset,
    ) {
        let mut state = self.0.borrow_mut();
        let slot = state.next_offsets.entry(partition).or_insert(next_offset);
        if next_offset > *slot {
            *slot = next_offset;
        }
    }

    fn live_offset(&self, partition: PartitionId) -> Option<Offset> {
        self.0.borrow().next_offsets.get(&partition).copied()
    }

    fn start_offset(&mut self, partition: PartitionId, offset: Offset) {
        let mut state = self.0.borrow_mut();
        let stale: Vec<(PartitionId, Offset)> = state
            .entries
            .range((partition, Offset::new(0))..(partition, offset))
            .map(|(&at, _)| at)
            .collect();
        for at in stale {
            state.entries.remove(&at);
        }
    }
}

/// A pool wired to scripted fakes, plus per-connection correlation
/// bookkeeping so responses line up automatically.
pub struct TestPool {
    /// The pool under test.
    pub pool: FetchPool,
    /// Transport activity log.
    pub transport: Rc<RefCell<TransportLog>>,
    /// Codec activity log and response script.
    pub codec: Rc<RefCell<CodecLog>>,
    correlations: HashMap<ConnectionId, u32>,
}

impl TestPool {
    /// Creates a pool bootstrapped from a single broker, `node-0`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(Limits::for_testing())
    }

    /// Creates a pool whose topics share one inspectable cache.
    #[must_use]
    pub fn with_shared_cache() -> (Self, SharedCache) {
        let cache = SharedCache::default();
        let factory_cache = cache.clone();
        let this = Self::build(
            Limits::for_testing(),
            Some(Box::new(move |_, _| Box::new(factory_cache.clone()))),
        );
        (this, cache)
    }

    /// Creates a pool with explicit limits.
    #[must_use]
    pub fn with_limits(limits: Limits) -> Self {
        Self::build(limits, None)
    }

    fn build(limits: Limits, factory: Option<CacheFactory>) -> Self {
        let transport = Rc::new(RefCell::new(TransportLog::default()));
        let codec = Rc::new(RefCell::new(CodecLog::default()));
        let config = FetchPoolConfig {
            bootstrap: vec![BrokerMetadata::new(NodeId::new(0), "broker-0", 9092)],
            limits,
        };
        let mut pool = FetchPool::new(
            config,
            Box::new(ScriptedTransport(Rc::clone(&transport))),
            Box::new(ScriptedCodec(Rc::clone(&codec))),
        )
        .unwrap();
        if let Some(factory) = factory {
            pool = pool.with_cache_factory(factory);
        }
        Self {
            pool,
            transport,
            codec,
            correlations: HashMap::new(),
        }
    }

    /// Marks a connection connected and grants it a large request window.
    pub fn ready(&mut self, connection: ConnectionId, now_us: u64) {
        self.pool.on_connected(connection, now_us);
        self.pool.on_window(connection, 1 << 20, 0, now_us);
    }

    /// Scripts `response` and delivers the matching response frame.
    ///
    /// # Panics
    /// Panics if the pool rejects the frame.
    pub fn respond(&mut self, connection: ConnectionId, response: KafkaResponse, now_us: u64) {
        self.codec.borrow_mut().responses.push_back(response);
        let correlation = self.correlations.entry(connection).or_insert(0);
        let frame = response_frame(*correlation);
        *correlation += 1;
        self.pool.on_data(connection, &frame, now_us).unwrap();
    }

    /// Drives the bootstrap metadata connection until `topic` completes,
    /// with the given leader per partition index.
    pub fn complete_topic(&mut self, topic: &str, leaders: &[NodeId], compacted: bool) {
        let meta_conn = ConnectionId::new(0);
        self.ready(meta_conn, 0);
        let brokers = leaders
            .iter()
            .map(|&node| BrokerMetadata::new(node, format!("broker-{}", node.get()), 9092))
            .collect();
        self.respond(
            meta_conn,
            metadata_response_with_brokers(topic, brokers, leaders),
            0,
        );
        self.respond(meta_conn, configs_response(topic, compacted), 0);
    }

    /// The most recently encoded request, if any.
    #[must_use]
    pub fn last_request(&self) -> Option<KafkaRequest> {
        self.codec.borrow().encoded.last().cloned()
    }
}

impl Default for TestPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A response frame carrying only a correlation id, as the scripted
/// codec ignores body bytes.
#[must_use]
pub fn response_frame(correlation: u32) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&4u32.to_be_bytes());
    frame.extend_from_slice(&correlation.to_be_bytes());
    frame
}

/// A metadata response advertising the given brokers and one topic.
#[must_use]
pub fn metadata_response_with_brokers(
    topic: &str,
    brokers: Vec<BrokerMetadata>,
    leaders: &[NodeId],
) -> KafkaResponse {
    KafkaResponse::Metadata(MetadataResponse {
        brokers,
        topics: vec![MetadataResponseTopic {
            topic: topic.to_string(),
            error: KafkaErrorCode::None,
            leaders: leaders.iter().copied().map(Some).collect(),
        }],
    })
}

/// A describe-configs response for one topic.
#[must_use]
pub fn configs_response(topic: &str, compacted: bool) -> KafkaResponse {
    KafkaResponse::DescribeConfigs(DescribeConfigsResponse {
        topic: topic.to_string(),
        error: KafkaErrorCode::None,
        compacted,
        delete_retention_ms: None,
    })
}

/// A record with a value and no key.
#[must_use]
pub fn record(offset: u64, value: &[u8]) -> Record {
    Record {
        offset: Offset::new(offset),
        timestamp: offset as i64,
        key: None,
        headers: Headers::default(),
        value: Some(Bytes::copy_from_slice(value)),
    }
}

/// A record with a key and a value.
#[must_use]
pub fn keyed_record(offset: u64, key: &[u8], value: &[u8]) -> Record {
    Record {
        key: Some(Bytes::copy_from_slice(key)),
        ..record(offset, value)
    }
}

/// A single-partition fetch response.
#[must_use]
pub fn fetch_response(
    topic: &str,
    partition: PartitionId,
    log_start: u64,
    records: Vec<Record>,
) -> KafkaResponse {
    let high_watermark = records
        .last()
        .map_or(Offset::new(log_start), |r| r.offset.next());
    KafkaResponse::Fetch(FetchResponse {
        topics: vec![FetchResponseTopic {
            topic: topic.to_string(),
            partitions: vec![FetchResponsePartition {
                partition,
                error: KafkaErrorCode::None,
                high_watermark,
                log_start_offset: Offset::new(log_start),
                records,
            }],
        }],
    })
}

/// A single-partition fetch response carrying only an error code.
#[must_use]
pub fn fetch_error_response(
    topic: &str,
    partition: PartitionId,
    error: KafkaErrorCode,
) -> KafkaResponse {
    KafkaResponse::Fetch(FetchResponse {
        topics: vec![FetchResponseTopic {
            topic: topic.to_string(),
            partitions: vec![FetchResponsePartition {
                partition,
                error,
                high_watermark: Offset::new(0),
                log_start_offset: Offset::new(0),
                records: Vec::new(),
            }],
        }],
    })
}

/// A single-partition list-offsets response.
#[must_use]
pub fn list_offsets_response(
    topic: &str,
    partition: PartitionId,
    timestamp: i64,
    offset: u64,
) -> KafkaResponse {
    KafkaResponse::ListOffsets(ListOffsetsResponse {
        topics: vec![ListOffsetsResponseTopic {
            topic: topic.to_string(),
            partitions: vec![ListOffsetsResponsePartition {
                partition,
                error: KafkaErrorCode::None,
                timestamp,
                offset: Offset::new(offset),
            }],
        }],
    })
}
