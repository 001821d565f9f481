//! The fetch pool: one coordinator multiplexing every consumer over a
//! bounded set of broker connections.
//!
//! The pool is event-driven and single-threaded. Callers feed it
//! transport events (`on_connected`, `on_data`, `on_window`, ...) and a
//! clock (`on_tick`); it reacts by advancing topic metadata, scheduling
//! at most one request per connection, dispatching fetched records
//! through each topic's routing tree, and moving ref-counted cursors
//! forward as consumers report progress.

use std::collections::HashMap;

use bytes::Bytes;
use manifold_core::{
    AttachId, ConnectionId, CorrelationId, KafkaErrorCode, Limits, NodeId, Offset, PartitionId,
};
use manifold_dispatch::{DispatchContext, MessageSink, ProgressSink, SinkRegistry};
use manifold_metadata::{
    Backoff, BrokerChange, BrokerMetadata, BrokerRegistry, MetadataOutcome, MetadataRequestKind,
    TopicLeaders, TopicMetadata, TopicMetadataCatalog,
};
use tracing::{debug, warn};

use crate::cache::{CacheWrite, NullTopicCache, TopicCache};
use crate::connection::{Connection, ConnectionKind, ConnectionState};
use crate::error::FetchError;
use crate::topic::FetchTopic;
use crate::transport::Transport;
use crate::wire::{
    read_frame, split_correlation, DescribeConfigsRequest, DescribeConfigsResponse, FetchRequest,
    FetchRequestPartition, FetchRequestTopic, FetchResponse, KafkaRequest, KafkaResponse,
    ListOffsetsRequest, ListOffsetsRequestPartition, ListOffsetsRequestTopic, MetadataRequest,
    MetadataResponse, MetadataResponseTopic, FRAME_HEADER_SIZE, TIMESTAMP_EARLIEST,
    TIMESTAMP_LATEST,
};

/// Static configuration for a [`FetchPool`].
#[derive(Debug, Clone)]
pub struct FetchPoolConfig {
    /// Brokers to bootstrap metadata from. Rotated on connection
    /// failure; at least one is required.
    pub bootstrap: Vec<BrokerMetadata>,
    /// Resource limits.
    pub limits: Limits,
}

/// Callback invoked when a consumer's position advances:
/// `(partition, old_offset, new_offset)`.
pub type ProgressFn = Box<dyn FnMut(PartitionId, Offset, Offset)>;

/// Builds a [`TopicCache`] for a newly completed topic:
/// `(topic_name, compacted)`.
pub type CacheFactory = Box<dyn Fn(&str, bool) -> Box<dyn TopicCache>>;

/// What a consumer wants to subscribe to.
#[derive(Debug, Clone, Default)]
pub struct AttachSpec {
    /// Topic name.
    pub topic: String,
    /// Requested starting offset per partition. Unlisted partitions
    /// start at the topic default: offset zero when compacted, the live
    /// tail otherwise.
    pub fetch_offsets: HashMap<PartitionId, Offset>,
    /// When set, only records whose key equals these exact bytes are
    /// delivered.
    pub key: Option<Bytes>,
    /// Header conditions; every named header must carry the given value.
    pub headers: Vec<(Bytes, Bytes)>,
}

/// Per-consumer bookkeeping.
struct AttachState {
    topic: String,
    key: Option<Bytes>,
    headers: Vec<(Bytes, Bytes)>,
    requested_offsets: HashMap<PartitionId, Offset>,
    /// Effective position per partition; mirrors the cursor this attach
    /// holds a reference at.
    positions: HashMap<PartitionId, Offset>,
    /// Held until topic metadata completes, then wrapped and registered.
    pending_sink: Option<Box<dyn MessageSink>>,
    sink: Option<manifold_core::SinkId>,
    progress: ProgressFn,
}

/// The fetch coordinator.
pub struct FetchPool {
    limits: Limits,
    backoff: Backoff,
    bootstrap: Vec<BrokerMetadata>,
    bootstrap_index: usize,
    transport: Box<dyn Transport>,
    codec: Box<dyn crate::wire::FetchCodec>,
    cache_factory: CacheFactory,
    catalog: TopicMetadataCatalog,
    brokers: BrokerRegistry,
    topics: HashMap<String, FetchTopic>,
    sinks: SinkRegistry,
    attaches: HashMap<AttachId, AttachState>,
    attach_by_sink: HashMap<manifold_core::SinkId, AttachId>,
    next_attach: AttachId,
    connections: HashMap<ConnectionId, Connection>,
    by_node: HashMap<(NodeId, ConnectionKind), ConnectionId>,
    metadata_connection: Option<ConnectionId>,
    next_connection: ConnectionId,
    flush_depth: u32,
}

impl FetchPool {
    /// Creates a pool over a transport and codec.
    ///
    /// # Errors
    /// Fails when the limits are inconsistent or no bootstrap broker is
    /// given.
    pub fn new(
        config: FetchPoolConfig,
        transport: Box<dyn Transport>,
        codec: Box<dyn crate::wire::FetchCodec>,
    ) -> Result<Self, FetchError> {
        config.limits.validate()?;
        if config.bootstrap.is_empty() {
            return Err(manifold_core::Error::InvalidArgument {
                name: "bootstrap",
                reason: "at least one bootstrap broker is required",
            }
            .into());
        }
        let backoff = Backoff::new(config.limits.backoff_min_ms, config.limits.backoff_max_ms);
        Ok(Self {
            limits: config.limits,
            backoff,
            bootstrap: config.bootstrap,
            bootstrap_index: 0,
            transport,
            codec,
            cache_factory: Box::new(|_, _| Box::new(NullTopicCache)),
            catalog: TopicMetadataCatalog::new(),
            brokers: BrokerRegistry::new(),
            topics: HashMap::new(),
            sinks: SinkRegistry::new(),
            attaches: HashMap::new(),
            attach_by_sink: HashMap::new(),
            next_attach: AttachId::new(0),
            connections: HashMap::new(),
            by_node: HashMap::new(),
            metadata_connection: None,
            next_connection: ConnectionId::new(0),
            flush_depth: 0,
        })
    }

    /// Replaces the cache factory. The default retains nothing.
    #[must_use]
    pub fn with_cache_factory(mut self, factory: CacheFactory) -> Self {
        self.cache_factory = factory;
        self
    }

    /// Attaches a consumer to a topic.
    ///
    /// The sink starts receiving records once topic metadata completes;
    /// until then the attach is pending. Progress is reported through
    /// `progress` every time this consumer's position moves forward.
    ///
    /// # Errors
    /// Fails when the spec is invalid.
    pub fn attach(
        &mut self,
        spec: AttachSpec,
        sink: Box<dyn MessageSink>,
        progress: ProgressFn,
        now_us: u64,
    ) -> Result<AttachId, FetchError> {
        if spec.topic.is_empty() {
            return Err(manifold_core::Error::InvalidArgument {
                name: "topic",
                reason: "must not be empty",
            }
            .into());
        }
        let id = self.next_attach;
        self.next_attach = self.next_attach.next();
        self.attaches.insert(
            id,
            AttachState {
                topic: spec.topic.clone(),
                key: spec.key,
                headers: spec.headers,
                requested_offsets: spec.fetch_offsets,
                positions: HashMap::new(),
                pending_sink: Some(sink),
                sink: None,
                progress,
            },
        );
        let ready = self.catalog.register_attach(&spec.topic, id);
        debug!(attach = %id, topic = %spec.topic, ready, "attach requested");
        if ready {
            self.finalize_attach(id);
        }
        self.flush(now_us);
        Ok(id)
    }

    /// Detaches a consumer, releasing its cursor references.
    ///
    /// # Errors
    /// Fails when the attach is unknown or its cursor bookkeeping has
    /// diverged.
    pub fn detach(&mut self, attach: AttachId, now_us: u64) -> Result<(), FetchError> {
        let Some(state) = self.attaches.remove(&attach) else {
            return Err(FetchError::UnknownAttach { attach });
        };
        let mut failure = None;
        if let Some(sink_id) = state.sink {
            self.attach_by_sink.remove(&sink_id);
            if let Some(topic) = self.topics.get_mut(&state.topic) {
                topic.tree.remove(state.key.as_deref(), &state.headers, sink_id);
                topic.attaches.remove(&attach);
                for (&partition, &offset) in &state.positions {
                    if let Err(err) = topic.cursors.detach(partition, offset, 1) {
                        failure = Some(err);
                    }
                }
            }
            self.sinks.remove(sink_id);
            let has_attaches = self
                .topics
                .get(&state.topic)
                .is_some_and(|topic| !topic.attaches.is_empty());
            self.catalog.release_if_unused(&state.topic, has_attaches);
            let drop_topic = self
                .topics
                .get(&state.topic)
                .is_some_and(|topic| topic.is_idle() && topic.cursors.is_empty());
            if drop_topic {
                self.topics.remove(&state.topic);
                debug!(topic = %state.topic, "topic dropped");
            }
        }
        debug!(attach = %attach, topic = %state.topic, "detached");
        if let Some(err) = failure {
            return Err(err.into());
        }
        self.flush(now_us);
        Ok(())
    }

    /// Keeps a topic fetching even with no consumers attached.
    ///
    /// The pool resolves the topic's metadata, attaches one bootstrap
    /// reference per partition, and fetches at full partition budget so
    /// records land in the topic cache.
    pub fn add_route(&mut self, topic: &str, now_us: u64) {
        self.catalog.mark_proactive(topic);
        if self.catalog.get(topic).is_some_and(TopicMetadata::is_complete) {
            self.complete_topic(topic, &[]);
        }
        debug!(topic, "proactive route added");
        self.flush(now_us);
    }

    /// A transport connect attempt succeeded.
    pub fn on_connected(&mut self, connection: ConnectionId, now_us: u64) {
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.state = ConnectionState::Ready;
            conn.retries = 0;
            conn.retry_at_us = None;
            debug!(connection = %connection, node = %conn.node, kind = %conn.kind, "connected");
            self.transport
                .credit(connection, self.limits.initial_response_budget);
        }
        self.flush(now_us);
    }

    /// A connection dropped; every topic led by its broker re-resolves.
    pub fn on_disconnected(&mut self, connection: ConnectionId, now_us: u64) {
        self.handle_connection_failure(connection, now_us);
        self.flush(now_us);
    }

    /// The peer granted request budget on a connection.
    pub fn on_window(&mut self, connection: ConnectionId, credit: u32, padding: u32, now_us: u64) {
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.grant_window(credit, padding);
        }
        self.flush(now_us);
    }

    /// Response bytes arrived on a connection.
    ///
    /// Complete frames are decoded and routed; partial bytes are kept
    /// for the next call. Consumed frame bytes are credited back to the
    /// peer so the response window refills as the pool keeps up.
    ///
    /// # Errors
    /// Fails on framing, correlation, or decode errors; the connection
    /// is torn down and retried before the error is returned.
    pub fn on_data(
        &mut self,
        connection: ConnectionId,
        data: &[u8],
        now_us: u64,
    ) -> Result<(), FetchError> {
        {
            let conn = self
                .connections
                .get_mut(&connection)
                .ok_or(FetchError::UnknownConnection { connection })?;
            conn.clear_idle();
            conn.recv.extend_from_slice(data);
        }

        loop {
            let step = {
                let Some(conn) = self.connections.get_mut(&connection) else {
                    break;
                };
                read_frame(&mut conn.recv, self.limits.max_frame_bytes)
            };
            let frame = match step {
                Ok(None) => break,
                Ok(Some(frame)) => frame,
                Err(err) => return self.fail_with(connection, err, now_us),
            };
            let frame_len = frame.len();
            let (correlation, body) = match split_correlation(frame) {
                Ok(split) => split,
                Err(err) => return self.fail_with(connection, err, now_us),
            };

            let pending = {
                let Some(conn) = self.connections.get_mut(&connection) else {
                    break;
                };
                match conn.complete_response() {
                    Some(pending) if pending.correlation == correlation => Ok(pending),
                    Some(pending) => Err(FetchError::CorrelationMismatch {
                        expected: pending.correlation,
                        actual: correlation,
                    }),
                    None => Err(FetchError::NoRequestInFlight { connection }),
                }
            };
            let pending = match pending {
                Ok(pending) => pending,
                Err(err) => return self.fail_with(connection, err, now_us),
            };

            // Refill the peer's response window for the consumed frame.
            let consumed = u32::try_from(frame_len + FRAME_HEADER_SIZE).unwrap_or(u32::MAX);
            self.transport.credit(connection, consumed);

            let response = match self.codec.decode(&pending.request, correlation, body) {
                Ok(response) => response,
                Err(err) => return self.fail_with(connection, err, now_us),
            };
            self.route_response(&pending.request, response, now_us);
        }

        if let Some(conn) = self.connections.get_mut(&connection) {
            if conn.in_flight.is_some() {
                conn.arm_idle(now_us, self.limits.read_idle_timeout_us);
            }
        }
        self.flush(now_us);
        Ok(())
    }

    /// Drives timers: read-idle expiry, reconnect backoff, and metadata
    /// refresh schedules.
    pub fn on_tick(&mut self, now_us: u64) {
        let expired: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|conn| conn.idle_expired(now_us))
            .map(|conn| conn.id)
            .collect();
        for id in expired {
            warn!(connection = %id, "read idle timeout");
            self.handle_connection_failure(id, now_us);
        }
        self.catalog.on_tick(now_us);
        self.flush(now_us);
    }

    /// Per-topic fetch state, if the topic is active.
    #[must_use]
    pub fn topic(&self, name: &str) -> Option<&FetchTopic> {
        self.topics.get(name)
    }

    /// A connection slot, if it exists.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Iterates all connection slots.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// The topic metadata catalog.
    #[must_use]
    pub const fn catalog(&self) -> &TopicMetadataCatalog {
        &self.catalog
    }

    /// Number of consumers attached or pending.
    #[must_use]
    pub fn attach_count(&self) -> usize {
        self.attaches.len()
    }

    // ---- Scheduling ----

    /// Runs scheduling passes until quiescent. Reentrant calls collapse
    /// into one extra pass of the outermost invocation.
    fn flush(&mut self, now_us: u64) {
        self.flush_depth += 1;
        if self.flush_depth > 1 {
            self.flush_depth = self.flush_depth.min(self.limits.max_nested_flush);
            return;
        }
        loop {
            self.flush_once(now_us);
            if self.flush_depth > 1 {
                self.flush_depth = 1;
                continue;
            }
            break;
        }
        self.flush_depth = 0;
    }

    fn flush_once(&mut self, now_us: u64) {
        self.ensure_metadata_connection(now_us);
        self.ensure_fetch_connections(now_us);
        self.pump_metadata(now_us);
        self.pump_fetch(now_us);
    }

    fn ensure_metadata_connection(&mut self, now_us: u64) {
        if self.catalog.is_empty() {
            return;
        }
        let id = match self.metadata_connection {
            Some(id) => id,
            None => {
                if self.connections.len() >= self.limits.max_connections as usize {
                    warn!("connection limit reached, metadata connection deferred");
                    return;
                }
                let id = self.next_connection;
                self.next_connection = self.next_connection.next();
                let node = self.bootstrap[self.bootstrap_index % self.bootstrap.len()].node_id;
                self.connections
                    .insert(id, Connection::new(id, ConnectionKind::Metadata, node));
                self.metadata_connection = Some(id);
                id
            }
        };
        self.connect_slot(id, now_us);
    }

    fn ensure_fetch_connections(&mut self, now_us: u64) {
        let mut needed: Vec<(NodeId, ConnectionKind)> = Vec::new();
        for (name, topic) in &self.topics {
            let Some(metadata) = self.catalog.get(name) else {
                continue;
            };
            if !metadata.is_complete() {
                continue;
            }
            for partition in topic.cursors.partitions() {
                let Some(node) = metadata.leader(partition) else {
                    continue;
                };
                if !needed.contains(&(node, ConnectionKind::Live)) {
                    needed.push((node, ConnectionKind::Live));
                }
                if topic.cursors.needs_historical(partition)
                    && !needed.contains(&(node, ConnectionKind::Historical))
                {
                    needed.push((node, ConnectionKind::Historical));
                }
            }
        }

        for (node, kind) in needed {
            let id = match self.by_node.get(&(node, kind)) {
                Some(&id) => id,
                None => {
                    if self.connections.len() >= self.limits.max_connections as usize {
                        warn!(node = %node, kind = %kind, "connection limit reached");
                        continue;
                    }
                    let id = self.next_connection;
                    self.next_connection = self.next_connection.next();
                    self.connections.insert(id, Connection::new(id, kind, node));
                    self.by_node.insert((node, kind), id);
                    debug!(connection = %id, node = %node, kind = %kind, "connection slot created");
                    id
                }
            };
            self.connect_slot(id, now_us);
        }
    }

    fn connect_slot(&mut self, id: ConnectionId, now_us: u64) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.state != ConnectionState::Disconnected {
            return;
        }
        if conn.retry_at_us.is_some_and(|at| at > now_us) {
            return;
        }
        let broker = if conn.kind == ConnectionKind::Metadata {
            self.bootstrap
                .get(self.bootstrap_index % self.bootstrap.len())
                .cloned()
        } else {
            self.brokers.get(conn.node).cloned()
        };
        let Some(broker) = broker else {
            return;
        };
        conn.node = broker.node_id;
        conn.state = ConnectionState::Connecting;
        conn.retry_at_us = None;
        debug!(connection = %id, host = %broker.host, port = broker.port, "connecting");
        if let Err(err) = self.transport.connect(id, &broker) {
            warn!(connection = %id, error = %err, "connect attempt failed");
            conn.state = ConnectionState::Disconnected;
            conn.retries += 1;
            let delay_ms = self.backoff.next(conn.retries);
            conn.retry_at_us = Some(now_us.saturating_add(delay_ms.saturating_mul(1_000)));
        }
    }

    fn pump_metadata(&mut self, now_us: u64) {
        let Some(id) = self.metadata_connection else {
            return;
        };
        if !self.connections.get(&id).is_some_and(Connection::can_send) {
            return;
        }
        let Some((topic, kind)) = self.catalog.next_request() else {
            return;
        };
        let topic = topic.to_string();
        let request = match kind {
            MetadataRequestKind::Leaders => {
                KafkaRequest::Metadata(MetadataRequest { topics: vec![topic] })
            }
            MetadataRequestKind::Configs => {
                KafkaRequest::DescribeConfigs(DescribeConfigsRequest { topic })
            }
        };
        self.send_request(id, request, now_us);
    }

    fn pump_fetch(&mut self, now_us: u64) {
        let ids: Vec<ConnectionId> = self.by_node.values().copied().collect();
        for id in ids {
            let Some(conn) = self.connections.get(&id) else {
                continue;
            };
            if !conn.can_send() {
                continue;
            }
            let node = conn.node;
            let kind = conn.kind;

            // Offset resolution blocks fetching for the affected
            // partitions, so it goes out first.
            if let Some(request) = self.build_list_offsets(node, kind) {
                self.send_request(id, request, now_us);
                continue;
            }
            if let Some(request) = self.build_fetch(node, kind) {
                self.send_request(id, request, now_us);
            }
        }
    }

    fn build_list_offsets(&self, node: NodeId, kind: ConnectionKind) -> Option<KafkaRequest> {
        if kind != ConnectionKind::Live {
            return None;
        }
        let mut topics = Vec::new();
        for (name, topic) in &self.topics {
            let Some(metadata) = self.catalog.get(name) else {
                continue;
            };
            if !metadata.is_complete() {
                continue;
            }
            let mut partitions = Vec::new();
            for partition in topic.cursors.partitions() {
                if metadata.leader(partition) != Some(node) {
                    continue;
                }
                if metadata.out_of_range(partition).is_some() {
                    partitions.push(ListOffsetsRequestPartition {
                        partition,
                        timestamp: TIMESTAMP_EARLIEST,
                    });
                } else if topic
                    .cursors
                    .highest(partition)
                    .is_some_and(|(offset, _)| offset.is_live())
                {
                    partitions.push(ListOffsetsRequestPartition {
                        partition,
                        timestamp: TIMESTAMP_LATEST,
                    });
                }
            }
            if !partitions.is_empty() {
                topics.push(ListOffsetsRequestTopic {
                    topic: name.clone(),
                    partitions,
                });
            }
        }
        (!topics.is_empty()).then(|| KafkaRequest::ListOffsets(ListOffsetsRequest { topics }))
    }

    fn build_fetch(&self, node: NodeId, kind: ConnectionKind) -> Option<KafkaRequest> {
        let mut topics = Vec::new();
        for (name, topic) in &self.topics {
            let Some(metadata) = self.catalog.get(name) else {
                continue;
            };
            if !metadata.is_complete() {
                continue;
            }
            let live = kind == ConnectionKind::Live;
            let mut partitions = Vec::new();
            let candidates: Vec<PartitionId> = if live {
                topic.cursors.partitions().collect()
            } else {
                topic.cursors.historical_partitions().collect()
            };
            for partition in candidates {
                if metadata.leader(partition) != Some(node) {
                    continue;
                }
                if metadata.out_of_range(partition).is_some() {
                    continue;
                }
                let checkpoint = if live {
                    topic.cursors.highest(partition)
                } else {
                    topic.cursors.lowest(partition)
                };
                let Some((offset, _)) = checkpoint else {
                    continue;
                };
                if offset.is_live() {
                    // Awaiting list-offsets resolution.
                    continue;
                }
                let budget = topic.writable_bytes(
                    &self.sinks,
                    live,
                    self.limits.fetch_partition_max_bytes,
                );
                if budget == 0 {
                    continue;
                }
                partitions.push(FetchRequestPartition {
                    partition,
                    fetch_offset: offset,
                    partition_max_bytes: budget,
                });
            }
            if !partitions.is_empty() {
                topics.push(FetchRequestTopic {
                    topic: name.clone(),
                    partitions,
                });
            }
        }
        (!topics.is_empty()).then(|| {
            KafkaRequest::Fetch(FetchRequest {
                max_wait_ms: self.limits.fetch_max_wait_ms,
                min_bytes: self.limits.fetch_min_bytes,
                max_bytes: self.limits.fetch_max_bytes,
                topics,
            })
        })
    }

    fn send_request(&mut self, id: ConnectionId, request: KafkaRequest, now_us: u64) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        let correlation = CorrelationId::new(conn.next_request_id);
        let frame = match self.codec.encode(correlation, &request) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection = %id, error = %err, "encode failed, request dropped");
                return;
            }
        };
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let frame_len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
        if frame_len.saturating_add(conn.request_padding) > conn.request_budget {
            debug!(connection = %id, frame_len, budget = conn.request_budget, "request deferred, no budget");
            return;
        }
        let claimed = conn.begin_request(request);
        debug_assert_eq!(claimed, correlation);
        conn.charge(frame_len);
        conn.arm_idle(now_us, self.limits.read_idle_timeout_us);
        debug!(connection = %id, correlation = %correlation, frame_len, "request sent");
        if let Err(err) = self.transport.send(id, frame) {
            warn!(connection = %id, error = %err, "send failed");
            self.handle_connection_failure(id, now_us);
        }
    }

    // ---- Response routing ----

    fn route_response(&mut self, request: &KafkaRequest, response: KafkaResponse, now_us: u64) {
        match response {
            KafkaResponse::Metadata(metadata) => self.handle_metadata(metadata, now_us),
            KafkaResponse::DescribeConfigs(configs) => self.handle_configs(configs, now_us),
            KafkaResponse::ListOffsets(offsets) => {
                if let KafkaRequest::ListOffsets(request) = request {
                    self.handle_list_offsets(request, &offsets, now_us);
                }
            }
            KafkaResponse::Fetch(fetch) => {
                if let KafkaRequest::Fetch(request) = request {
                    self.handle_fetch(request, &fetch, now_us);
                }
            }
        }
    }

    fn handle_metadata(&mut self, response: MetadataResponse, now_us: u64) {
        for broker in response.brokers {
            self.observe_broker(broker);
        }
        for MetadataResponseTopic {
            topic: name,
            error,
            leaders,
        } in response.topics
        {
            let slice = TopicLeaders { error, leaders };
            let outcome = self
                .catalog
                .apply_metadata(&name, &slice, &self.backoff, now_us);
            self.apply_outcome(&name, outcome);
        }
    }

    fn handle_configs(&mut self, response: DescribeConfigsResponse, now_us: u64) {
        let outcome = self.catalog.apply_configs(
            &response.topic,
            response.error,
            response.compacted,
            response.delete_retention_ms,
            &self.backoff,
            now_us,
        );
        self.apply_outcome(&response.topic, outcome);
    }

    fn apply_outcome(&mut self, topic: &str, outcome: MetadataOutcome) {
        match outcome {
            MetadataOutcome::NeedsConfigs | MetadataOutcome::Ignored => {}
            MetadataOutcome::Scheduled { error, refresh_at_us } => {
                debug!(topic, ?error, refresh_at_us, "topic refresh pending");
            }
            MetadataOutcome::Complete { attaches } => self.complete_topic(topic, &attaches),
            MetadataOutcome::Failed {
                error,
                attaches,
                reattach,
            } => {
                warn!(topic, ?error, reattach, "topic failed");
                self.detach_topic(topic, reattach);
                for id in attaches {
                    if let Some(mut state) = self.attaches.remove(&id) {
                        if let Some(sink) = state.pending_sink.as_deref_mut() {
                            sink.detached(reattach);
                        }
                    }
                }
            }
        }
    }

    fn observe_broker(&mut self, broker: BrokerMetadata) {
        match self.brokers.observe(broker) {
            BrokerChange::Unchanged | BrokerChange::Added => {}
            BrokerChange::Moved { previous } => {
                warn!(node = %previous.node_id, "broker moved, rebinding connections");
                for kind in [ConnectionKind::Live, ConnectionKind::Historical] {
                    if let Some(&id) = self.by_node.get(&(previous.node_id, kind)) {
                        self.transport.close(id);
                        if let Some(conn) = self.connections.get_mut(&id) {
                            conn.reinitialize();
                            conn.retry_at_us = None;
                        }
                    }
                }
            }
        }
    }

    fn complete_topic(&mut self, name: &str, pending: &[AttachId]) {
        let Some(metadata) = self.catalog.get(name) else {
            return;
        };
        let compacted = metadata.compacted();
        let proactive = metadata.proactive();
        let partitions: Vec<PartitionId> = metadata.partition_ids().collect();

        let cache_factory = &self.cache_factory;
        let topic = self.topics.entry(name.to_string()).or_insert_with(|| {
            FetchTopic::new(name, cache_factory(name, compacted), compacted)
        });
        topic.compacted = compacted;
        if proactive {
            topic.proactive = true;
            if !topic.bootstrapped {
                for &partition in &partitions {
                    let default = if compacted { Offset::new(0) } else { Offset::LIVE };
                    let outcome = topic.cursors.attach(partition, default, 1);
                    topic
                        .bootstrap_positions
                        .insert(partition, outcome.effective_offset);
                }
                topic.bootstrapped = true;
                debug!(topic = %name, partitions = partitions.len(), "proactive bootstrap attached");
            }
        }

        for &id in pending {
            self.finalize_attach(id);
        }
    }

    fn finalize_attach(&mut self, id: AttachId) {
        let Some(state) = self.attaches.get_mut(&id) else {
            return;
        };
        if state.sink.is_some() {
            return;
        }
        let topic_name = state.topic.clone();
        let Some(metadata) = self.catalog.get(&topic_name) else {
            return;
        };
        if !metadata.is_complete() {
            return;
        }
        let compacted = metadata.compacted();
        let partitions: Vec<(PartitionId, Offset)> = metadata
            .partition_ids()
            .map(|p| (p, metadata.first_offset(p)))
            .collect();

        let cache_factory = &self.cache_factory;
        let topic = self.topics.entry(topic_name.clone()).or_insert_with(|| {
            FetchTopic::new(&topic_name, cache_factory(&topic_name, compacted), compacted)
        });

        let mut positions = HashMap::new();
        for (partition, first_offset) in partitions {
            let default = if compacted { Offset::new(0) } else { Offset::LIVE };
            let mut requested = state
                .requested_offsets
                .get(&partition)
                .copied()
                .unwrap_or(default);
            // A position behind the log's known start would only bounce
            // off the broker; clamp it up front.
            if !requested.is_live() && requested < first_offset {
                requested = first_offset;
            }
            if compacted && !requested.is_live() {
                // Replay retained history locally before joining the
                // shared fetch stream.
                if let Some(sink) = state.pending_sink.as_deref_mut() {
                    replay_cache(
                        topic.cache.as_ref(),
                        sink,
                        partition,
                        requested,
                        state.key.as_deref(),
                        &state.headers,
                    );
                }
                if let Some(live) = topic.cache.live_offset(partition) {
                    if live > requested {
                        requested = live;
                    }
                }
            }
            let outcome = topic.cursors.attach(partition, requested, 1);
            positions.insert(partition, outcome.effective_offset);
        }

        let Some(sink) = state.pending_sink.take() else {
            return;
        };
        let wrapped = ProgressSink::with_positions(sink, positions.iter().map(|(&p, &o)| (p, o)));
        let sink_id = self.sinks.register(Box::new(wrapped));
        topic.tree.add(state.key.as_ref(), &state.headers, sink_id);
        topic.attaches.insert(id);
        state.sink = Some(sink_id);
        state.positions = positions;
        self.attach_by_sink.insert(sink_id, id);
        debug!(attach = %id, sink = %sink_id, topic = %topic_name, "attach finalized");
    }

    fn handle_list_offsets(
        &mut self,
        request: &ListOffsetsRequest,
        response: &crate::wire::ListOffsetsResponse,
        now_us: u64,
    ) {
        let mut drops: Vec<(String, bool)> = Vec::new();
        {
            let topics = &mut self.topics;
            let sinks = &mut self.sinks;
            let attaches = &mut self.attaches;
            let catalog = &mut self.catalog;
            let backoff = &self.backoff;

            for rt in &response.topics {
                let Some(topic) = topics.get_mut(&rt.topic) else {
                    continue;
                };
                'partitions: for rp in &rt.partitions {
                    let Some(timestamp) = requested_timestamp(request, &rt.topic, rp.partition)
                    else {
                        continue;
                    };
                    match rp.error {
                        KafkaErrorCode::None => {}
                        error if error.is_fatal() => {
                            drops.push((rt.topic.clone(), false));
                            catalog.remove(&rt.topic);
                            break 'partitions;
                        }
                        error => {
                            catalog.schedule_refresh(&rt.topic, error, backoff, now_us);
                            continue;
                        }
                    }

                    if timestamp == TIMESTAMP_LATEST {
                        // A checkpoint past the broker's latest offset
                        // means the topic was deleted and recreated.
                        let recreated = topic
                            .cursors
                            .checkpoints_for(rp.partition)
                            .any(|(offset, _)| !offset.is_live() && offset > rp.offset);
                        if recreated {
                            warn!(
                                topic = %rt.topic,
                                partition = %rp.partition,
                                latest = %rp.offset,
                                "topic recreated, detaching consumers"
                            );
                            drops.push((rt.topic.clone(), true));
                            catalog.remove(&rt.topic);
                            break 'partitions;
                        }
                        if let Some((old, new)) =
                            topic.cursors.set_live_offset(rp.partition, rp.offset)
                        {
                            topic.tree.adjust_offset(sinks, rp.partition, old, new);
                            rebase_positions(attaches, &topic.attaches, rp.partition, old, new);
                            if let Some(pos) = topic.bootstrap_positions.get_mut(&rp.partition) {
                                if *pos == old {
                                    *pos = new;
                                }
                            }
                            debug!(
                                topic = %rt.topic,
                                partition = %rp.partition,
                                offset = %new,
                                "live tail resolved"
                            );
                        }
                    } else if timestamp == TIMESTAMP_EARLIEST {
                        // An earliest offset at or below the bounced
                        // request means the log's end moved backwards:
                        // the topic was deleted and recreated.
                        let bounced = catalog
                            .get(&rt.topic)
                            .and_then(|metadata| metadata.out_of_range(rp.partition));
                        if bounced.is_some_and(|requested| rp.offset <= requested) {
                            warn!(
                                topic = %rt.topic,
                                partition = %rp.partition,
                                earliest = %rp.offset,
                                "topic recreated, detaching consumers"
                            );
                            drops.push((rt.topic.clone(), true));
                            catalog.remove(&rt.topic);
                            break 'partitions;
                        }
                        catalog.record_first_offset(&rt.topic, rp.partition, rp.offset);
                        catalog.clear_out_of_range(&rt.topic, rp.partition);
                        topic.cache.start_offset(rp.partition, rp.offset);
                        // Clamp every checkpoint that fell off the log's
                        // retained range; no progress is reported, the
                        // records are simply gone.
                        for (offset, refs) in
                            topic.cursors.checkpoints_below(rp.partition, rp.offset)
                        {
                            if topic
                                .cursors
                                .advance(rp.partition, offset, rp.offset, refs)
                                .is_ok()
                            {
                                topic.tree.adjust_offset(sinks, rp.partition, offset, rp.offset);
                                rebase_positions(
                                    attaches,
                                    &topic.attaches,
                                    rp.partition,
                                    offset,
                                    rp.offset,
                                );
                                if let Some(pos) =
                                    topic.bootstrap_positions.get_mut(&rp.partition)
                                {
                                    if *pos == offset {
                                        *pos = rp.offset;
                                    }
                                }
                            }
                        }
                        debug!(
                            topic = %rt.topic,
                            partition = %rp.partition,
                            earliest = %rp.offset,
                            "earliest offset learned"
                        );
                    }
                }
            }
        }
        for (name, reattach) in drops {
            self.detach_topic(&name, reattach);
        }
    }

    fn handle_fetch(&mut self, request: &FetchRequest, response: &FetchResponse, now_us: u64) {
        let mut drops: Vec<String> = Vec::new();
        let mut aborts: Vec<AttachId> = Vec::new();
        {
            let topics = &mut self.topics;
            let sinks = &mut self.sinks;
            let attaches = &mut self.attaches;
            let attach_by_sink = &self.attach_by_sink;
            let catalog = &mut self.catalog;
            let backoff = &self.backoff;

            for rt in &response.topics {
                let Some(topic) = topics.get_mut(&rt.topic) else {
                    continue;
                };
                'partitions: for rp in &rt.partitions {
                    let Some(request_offset) = request.requested_offset(&rt.topic, rp.partition)
                    else {
                        continue;
                    };
                    match rp.error {
                        KafkaErrorCode::None => {}
                        KafkaErrorCode::OffsetOutOfRange => {
                            debug!(
                                topic = %rt.topic,
                                partition = %rp.partition,
                                requested = %request_offset,
                                "offset out of range"
                            );
                            catalog.flag_out_of_range(&rt.topic, rp.partition, request_offset);
                            continue;
                        }
                        error if error.is_fatal() => {
                            drops.push(rt.topic.clone());
                            catalog.remove(&rt.topic);
                            break 'partitions;
                        }
                        error => {
                            catalog.schedule_refresh(&rt.topic, error, backoff, now_us);
                            continue;
                        }
                    }

                    if catalog.record_first_offset(&rt.topic, rp.partition, rp.log_start_offset) {
                        topic.cache.start_offset(rp.partition, rp.log_start_offset);
                    }

                    let mut last = None;
                    for record in &rp.records {
                        // A batch may open behind the requested offset
                        // when the broker returns a whole record batch.
                        if record.offset < request_offset {
                            continue;
                        }
                        topic.cache.add(&CacheWrite {
                            partition: rp.partition,
                            request_offset,
                            message_offset: record.offset,
                            timestamp: record.timestamp,
                            trace_id: 0,
                            key: record.key.as_deref(),
                            headers: &record.headers,
                            value: record.value.as_deref(),
                            cache_if_new: topic.compacted,
                        });
                        let ctx = DispatchContext {
                            partition: rp.partition,
                            request_offset,
                            message_offset: record.offset,
                            timestamp: record.timestamp,
                            trace_id: 0,
                            key: record.key.as_deref(),
                            headers: &record.headers,
                            value: record.value.as_deref(),
                        };
                        let _ = topic.tree.dispatch(sinks, &ctx);
                        last = Some(record.offset);
                    }
                    let next = last.map_or(request_offset, |offset| offset.next());
                    topic
                        .cache
                        .extend_next_offset(rp.partition, request_offset, next);
                    if next == request_offset {
                        continue;
                    }

                    for (sink_id, prog) in
                        topic.tree.flush(sinks, rp.partition, request_offset, next)
                    {
                        match topic.cursors.advance(
                            rp.partition,
                            prog.old_offset,
                            prog.new_offset,
                            1,
                        ) {
                            Ok(()) => {
                                if let Some(&attach_id) = attach_by_sink.get(&sink_id) {
                                    if let Some(state) = attaches.get_mut(&attach_id) {
                                        state.positions.insert(rp.partition, prog.new_offset);
                                        (state.progress)(
                                            rp.partition,
                                            prog.old_offset,
                                            prog.new_offset,
                                        );
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(
                                    sink = %sink_id,
                                    partition = %rp.partition,
                                    error = %err,
                                    "cursor advance failed, aborting consumer"
                                );
                                if let Some(&attach_id) = attach_by_sink.get(&sink_id) {
                                    aborts.push(attach_id);
                                }
                            }
                        }
                    }

                    if let Some(pos) = topic.bootstrap_positions.get_mut(&rp.partition) {
                        if *pos == request_offset
                            && topic
                                .cursors
                                .advance(rp.partition, request_offset, next, 1)
                                .is_ok()
                        {
                            *pos = next;
                        }
                    }
                }
            }
        }
        for name in drops {
            self.detach_topic(&name, false);
        }
        for id in aborts {
            self.abort_attach(id);
        }
    }

    // ---- Failure paths ----

    /// Force-detaches every consumer of a topic and drops its state.
    fn detach_topic(&mut self, name: &str, reattach: bool) {
        let ids: Vec<AttachId> = self
            .topics
            .get(name)
            .map(|topic| topic.attaches.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            let Some(state) = self.attaches.remove(&id) else {
                continue;
            };
            if let Some(sink_id) = state.sink {
                self.attach_by_sink.remove(&sink_id);
                if let Some(mut sink) = self.sinks.remove(sink_id) {
                    sink.detached(reattach);
                }
            }
        }
        if self.topics.remove(name).is_some() {
            warn!(topic = name, reattach, "topic force-detached");
        }
    }

    /// Force-detaches a single consumer whose bookkeeping diverged.
    fn abort_attach(&mut self, id: AttachId) {
        let Some(state) = self.attaches.remove(&id) else {
            return;
        };
        if let Some(sink_id) = state.sink {
            self.attach_by_sink.remove(&sink_id);
            if let Some(topic) = self.topics.get_mut(&state.topic) {
                topic.tree.remove(state.key.as_deref(), &state.headers, sink_id);
                topic.attaches.remove(&id);
                for (&partition, &offset) in &state.positions {
                    let _ = topic.cursors.detach(partition, offset, 1);
                }
            }
            if let Some(mut sink) = self.sinks.remove(sink_id) {
                sink.detached(false);
            }
        }
        warn!(attach = %id, topic = %state.topic, "consumer aborted");
    }

    fn fail_with(
        &mut self,
        connection: ConnectionId,
        err: FetchError,
        now_us: u64,
    ) -> Result<(), FetchError> {
        self.handle_connection_failure(connection, now_us);
        self.flush(now_us);
        Err(err)
    }

    fn handle_connection_failure(&mut self, connection: ConnectionId, now_us: u64) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            return;
        };
        let node = conn.node;
        let kind = conn.kind;
        conn.reinitialize();
        conn.retries += 1;
        let delay_ms = self.backoff.next(conn.retries);
        conn.retry_at_us = Some(now_us.saturating_add(delay_ms.saturating_mul(1_000)));
        warn!(
            connection = %connection,
            node = %node,
            kind = %kind,
            retries = conn.retries,
            "connection failed"
        );
        self.transport.abort(connection);
        if kind == ConnectionKind::Metadata {
            // Rotate to the next bootstrap broker for the retry.
            self.bootstrap_index = (self.bootstrap_index + 1) % self.bootstrap.len();
        } else {
            let affected = self.catalog.invalidate_broker(node);
            if !affected.is_empty() {
                debug!(topics = affected.len(), "topics re-resolving leaders");
            }
        }
    }
}

/// Replays retained cache entries into a not-yet-registered sink,
/// honoring the attach's key and header conditions.
fn replay_cache(
    cache: &dyn TopicCache,
    sink: &mut dyn MessageSink,
    partition: PartitionId,
    from: Offset,
    key: Option<&[u8]>,
    headers: &[(Bytes, Bytes)],
) {
    let mut delivered = None;
    for record in cache.entries(partition, from) {
        if let Some(key) = key {
            if record.key.as_deref() != Some(key) {
                continue;
            }
        }
        if !headers
            .iter()
            .all(|(name, value)| record.headers.matches(name, value))
        {
            continue;
        }
        let ctx = DispatchContext {
            partition,
            request_offset: from,
            message_offset: record.offset,
            timestamp: record.timestamp,
            trace_id: 0,
            key: record.key.as_deref(),
            headers: &record.headers,
            value: record.value.as_deref(),
        };
        let _ = sink.dispatch(&ctx);
        delivered = Some(record.offset);
    }
    if let Some(last) = delivered {
        let _ = sink.flush(partition, from, last.next());
    }
}

fn rebase_positions(
    attaches: &mut HashMap<AttachId, AttachState>,
    members: &std::collections::HashSet<AttachId>,
    partition: PartitionId,
    old: Offset,
    new: Offset,
) {
    for id in members {
        if let Some(state) = attaches.get_mut(id) {
            if state.positions.get(&partition) == Some(&old) {
                state.positions.insert(partition, new);
            }
        }
    }
}

fn requested_timestamp(
    request: &ListOffsetsRequest,
    topic: &str,
    partition: PartitionId,
) -> Option<i64> {
    request
        .topics
        .iter()
        .find(|t| t.topic == topic)?
        .partitions
        .iter()
        .find(|p| p.partition == partition)
        .map(|p| p.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{
        FetchCodec, FetchResponsePartition, FetchResponseTopic, ListOffsetsResponse,
    };
    use manifold_core::{Headers, Record};
    use manifold_dispatch::{DispatchFlags, SinkProgress};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct TransportLog {
        connects: Vec<ConnectionId>,
        sent: Vec<(ConnectionId, usize)>,
        credits: Vec<(ConnectionId, u32)>,
        aborted: Vec<ConnectionId>,
    }

    struct TestTransport(Rc<RefCell<TransportLog>>);

    impl Transport for TestTransport {
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

        fn close(&mut self, _connection: ConnectionId) {}
    }

    #[derive(Default)]
    struct CodecLog {
        encoded: Vec<KafkaRequest>,
        responses: VecDeque<KafkaResponse>,
    }

    struct TestCodec(Rc<RefCell<CodecLog>>);

    impl FetchCodec for TestCodec {
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

    struct RecordingSink(Rc<RefCell<Vec<(Offset, Option<Vec<u8>>)>>>);

    impl MessageSink for RecordingSink {
        fn dispatch(&mut self, ctx: &DispatchContext<'_>) -> DispatchFlags {
            self.0
                .borrow_mut()
                .push((ctx.message_offset, ctx.value.map(<[u8]>::to_vec)));
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
    }

    struct Harness {
        pool: FetchPool,
        transport: Rc<RefCell<TransportLog>>,
        codec: Rc<RefCell<CodecLog>>,
    }

    fn harness() -> Harness {
        let transport = Rc::new(RefCell::new(TransportLog::default()));
        let codec = Rc::new(RefCell::new(CodecLog::default()));
        let config = FetchPoolConfig {
            bootstrap: vec![BrokerMetadata::new(NodeId::new(0), "broker-0", 9092)],
            limits: Limits::for_testing(),
        };
        let pool = FetchPool::new(
            config,
            Box::new(TestTransport(Rc::clone(&transport))),
            Box::new(TestCodec(Rc::clone(&codec))),
        )
        .unwrap();
        Harness {
            pool,
            transport,
            codec,
        }
    }

    fn response_frame(correlation: u32) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&4u32.to_be_bytes());
        frame.extend_from_slice(&correlation.to_be_bytes());
        frame
    }

    fn metadata_response(topic: &str, leaders: Vec<Option<NodeId>>) -> KafkaResponse {
        KafkaResponse::Metadata(MetadataResponse {
            brokers: vec![BrokerMetadata::new(NodeId::new(0), "broker-0", 9092)],
            topics: vec![MetadataResponseTopic {
                topic: topic.to_string(),
                error: KafkaErrorCode::None,
                leaders,
            }],
        })
    }

    fn configs_response(topic: &str, compacted: bool) -> KafkaResponse {
        KafkaResponse::DescribeConfigs(DescribeConfigsResponse {
            topic: topic.to_string(),
            error: KafkaErrorCode::None,
            compacted,
            delete_retention_ms: None,
        })
    }

    fn attach_orders(h: &mut Harness) -> (AttachId, Rc<RefCell<Vec<(Offset, Option<Vec<u8>>)>>>) {
        let received = Rc::new(RefCell::new(Vec::new()));
        let spec = AttachSpec {
            topic: "orders".to_string(),
            fetch_offsets: [(PartitionId::new(0), Offset::new(5))].into_iter().collect(),
            key: None,
            headers: Vec::new(),
        };
        let attach = h
            .pool
            .attach(
                spec,
                Box::new(RecordingSink(Rc::clone(&received))),
                Box::new(|_, _, _| {}),
                0,
            )
            .unwrap();
        (attach, received)
    }

    /// Drives the metadata connection through leaders and configs so the
    /// topic completes with one partition led by node 0.
    fn complete_orders(h: &mut Harness) {
        let meta_conn = ConnectionId::new(0);
        h.pool.on_connected(meta_conn, 0);
        h.pool.on_window(meta_conn, 1 << 20, 0, 0);
        assert!(matches!(
            h.codec.borrow().encoded.last(),
            Some(KafkaRequest::Metadata(_))
        ));

        h.codec
            .borrow_mut()
            .responses
            .push_back(metadata_response("orders", vec![Some(NodeId::new(0))]));
        h.pool.on_data(meta_conn, &response_frame(0), 0).unwrap();
        assert!(matches!(
            h.codec.borrow().encoded.last(),
            Some(KafkaRequest::DescribeConfigs(_))
        ));

        h.codec
            .borrow_mut()
            .responses
            .push_back(configs_response("orders", false));
        h.pool.on_data(meta_conn, &response_frame(1), 0).unwrap();
    }

    #[test]
    fn test_new_requires_bootstrap() {
        let transport = Rc::new(RefCell::new(TransportLog::default()));
        let codec = Rc::new(RefCell::new(CodecLog::default()));
        let config = FetchPoolConfig {
            bootstrap: Vec::new(),
            limits: Limits::for_testing(),
        };
        let result = FetchPool::new(
            config,
            Box::new(TestTransport(transport)),
            Box::new(TestCodec(codec)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_detach_unknown_attach() {
        let mut h = harness();
        assert!(matches!(
            h.pool.detach(AttachId::new(99), 0),
            Err(FetchError::UnknownAttach { .. })
        ));
    }

    #[test]
    fn test_attach_opens_metadata_connection() {
        let mut h = harness();
        let _ = attach_orders(&mut h);
        assert_eq!(h.transport.borrow().connects, vec![ConnectionId::new(0)]);
        // Connection not yet ready: nothing sent.
        assert!(h.codec.borrow().encoded.is_empty());
        assert_eq!(h.pool.attach_count(), 1);
    }

    #[test]
    fn test_metadata_completion_opens_fetch_connection() {
        let mut h = harness();
        let _ = attach_orders(&mut h);
        complete_orders(&mut h);

        // A live fetch connection to node 0 comes up next.
        assert_eq!(
            h.transport.borrow().connects,
            vec![ConnectionId::new(0), ConnectionId::new(1)]
        );
        let topic = h.pool.topic("orders").unwrap();
        assert_eq!(
            topic.cursors.highest(PartitionId::new(0)),
            Some((Offset::new(5), 1))
        );
    }

    #[test]
    fn test_fetch_round_trip_advances_cursor() {
        let mut h = harness();
        let (_, received) = attach_orders(&mut h);
        complete_orders(&mut h);

        let fetch_conn = ConnectionId::new(1);
        h.pool.on_connected(fetch_conn, 0);
        h.pool.on_window(fetch_conn, 1 << 20, 0, 0);
        let sent_fetch = match h.codec.borrow().encoded.last() {
            Some(KafkaRequest::Fetch(request)) => request.clone(),
            other => panic!("expected fetch request, got {other:?}"),
        };
        assert_eq!(
            sent_fetch.requested_offset("orders", PartitionId::new(0)),
            Some(Offset::new(5))
        );

        let records = vec![
            Record {
                offset: Offset::new(5),
                timestamp: 1,
                key: None,
                headers: Headers::default(),
                value: Some(Bytes::from_static(b"a")),
            },
            Record {
                offset: Offset::new(6),
                timestamp: 2,
                key: None,
                headers: Headers::default(),
                value: Some(Bytes::from_static(b"b")),
            },
        ];
        h.codec
            .borrow_mut()
            .responses
            .push_back(KafkaResponse::Fetch(FetchResponse {
                topics: vec![FetchResponseTopic {
                    topic: "orders".to_string(),
                    partitions: vec![FetchResponsePartition {
                        partition: PartitionId::new(0),
                        error: KafkaErrorCode::None,
                        high_watermark: Offset::new(7),
                        log_start_offset: Offset::new(0),
                        records,
                    }],
                }],
            }));
        h.pool.on_data(fetch_conn, &response_frame(0), 0).unwrap();

        assert_eq!(received.borrow().len(), 2);
        let topic = h.pool.topic("orders").unwrap();
        assert_eq!(
            topic.cursors.highest(PartitionId::new(0)),
            Some((Offset::new(7), 1))
        );
    }

    #[test]
    fn test_live_attach_waits_for_list_offsets() {
        let mut h = harness();
        let received = Rc::new(RefCell::new(Vec::new()));
        let spec = AttachSpec {
            topic: "orders".to_string(),
            ..AttachSpec::default()
        };
        h.pool
            .attach(
                spec,
                Box::new(RecordingSink(received)),
                Box::new(|_, _, _| {}),
                0,
            )
            .unwrap();
        complete_orders(&mut h);

        let fetch_conn = ConnectionId::new(1);
        h.pool.on_connected(fetch_conn, 0);
        h.pool.on_window(fetch_conn, 1 << 20, 0, 0);
        // The live tail is unresolved: list-offsets goes out, not fetch.
        assert!(matches!(
            h.codec.borrow().encoded.last(),
            Some(KafkaRequest::ListOffsets(_))
        ));

        h.codec
            .borrow_mut()
            .responses
            .push_back(KafkaResponse::ListOffsets(ListOffsetsResponse {
                topics: vec![crate::wire::ListOffsetsResponseTopic {
                    topic: "orders".to_string(),
                    partitions: vec![crate::wire::ListOffsetsResponsePartition {
                        partition: PartitionId::new(0),
                        error: KafkaErrorCode::None,
                        timestamp: TIMESTAMP_LATEST,
                        offset: Offset::new(42),
                    }],
                }],
            }));
        h.pool.on_data(fetch_conn, &response_frame(0), 0).unwrap();

        let topic = h.pool.topic("orders").unwrap();
        assert_eq!(
            topic.cursors.highest(PartitionId::new(0)),
            Some((Offset::new(42), 1))
        );
        // Resolution unblocks an actual fetch at the resolved offset.
        let sent_fetch = match h.codec.borrow().encoded.last() {
            Some(KafkaRequest::Fetch(request)) => request.clone(),
            other => panic!("expected fetch request, got {other:?}"),
        };
        assert_eq!(
            sent_fetch.requested_offset("orders", PartitionId::new(0)),
            Some(Offset::new(42))
        );
    }

    #[test]
    fn test_idle_timeout_aborts_and_schedules_retry() {
        let mut h = harness();
        let _ = attach_orders(&mut h);
        let meta_conn = ConnectionId::new(0);
        h.pool.on_connected(meta_conn, 0);
        h.pool.on_window(meta_conn, 1 << 20, 0, 0);
        assert_eq!(h.codec.borrow().encoded.len(), 1);

        // No response before the deadline.
        let past_deadline = Limits::for_testing().read_idle_timeout_us + 1;
        h.pool.on_tick(past_deadline);
        assert_eq!(h.transport.borrow().aborted, vec![meta_conn]);
        let conn = h.pool.connection(meta_conn).unwrap();
        assert_eq!(conn.state, ConnectionState::Disconnected);
        assert!(conn.retry_at_us.is_some());
    }
}
