//! Per-topic metadata state machine.

use std::collections::HashMap;

use manifold_core::{AttachId, KafkaErrorCode, NodeId, Offset, PartitionId};
use tracing::{debug, warn};

use crate::backoff::Backoff;

/// Kafka's default `delete.retention.ms` for compacted topics.
pub const DEFAULT_DELETE_RETENTION_MS: u64 = 86_400_000;

/// Where a topic's metadata stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataState {
    /// A metadata round trip is needed as soon as possible.
    Required,
    /// A refresh timer is armed; flips back to `Required` when it fires.
    Scheduled,
    /// Leaders and configs are known.
    Complete,
}

/// Which round trip a `Required` topic needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataRequestKind {
    /// A metadata request to learn per-partition leaders.
    Leaders,
    /// A describe-configs request to learn compaction and retention.
    Configs,
}

/// Decoded per-topic slice of a metadata response: the broker's error
/// code and the leader (if known) for each partition index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLeaders {
    /// Topic-level error code.
    pub error: KafkaErrorCode,
    /// Leader per partition index; `None` when the leader is unknown.
    pub leaders: Vec<Option<NodeId>>,
}

/// What a metadata or configs response did to a topic.
#[derive(Debug, PartialEq, Eq)]
pub enum MetadataOutcome {
    /// Leaders accepted; a describe-configs round trip still blocks
    /// completion.
    NeedsConfigs,
    /// The topic reached `Complete`; finalize these pending attaches.
    Complete {
        /// Attaches that were waiting on this topic.
        attaches: Vec<AttachId>,
    },
    /// Recoverable error; a refresh is scheduled.
    Scheduled {
        /// The error that caused the retry.
        error: KafkaErrorCode,
        /// Absolute time the refresh fires, in microseconds.
        refresh_at_us: u64,
    },
    /// Fatal error; the topic was dropped and every waiting attach must
    /// be detached.
    Failed {
        /// The fatal error.
        error: KafkaErrorCode,
        /// Attaches that were waiting on this topic.
        attaches: Vec<AttachId>,
        /// True when consumers should re-attach at offset zero.
        reattach: bool,
    },
    /// The topic is no longer tracked; drop the response.
    Ignored,
}

/// Metadata for one topic.
#[derive(Debug)]
pub struct TopicMetadata {
    state: MetadataState,
    error: Option<KafkaErrorCode>,
    /// Set after a successful metadata response; cleared on invalidation.
    leaders_known: bool,
    /// Configs survive broker invalidation; only fetched once.
    configs_known: bool,
    compacted: bool,
    delete_retention_ms: u64,
    /// Sized once on first successful metadata; a later size change is
    /// `PartitionCountChanged`.
    leaders: Vec<Option<NodeId>>,
    first_offsets: Vec<Offset>,
    /// Requested offset that bounced with `OFFSET_OUT_OF_RANGE`, per
    /// partition, until a list-offsets round trip clears it.
    out_of_range: Vec<Option<Offset>>,
    retries: u32,
    refresh_at_us: Option<u64>,
    pending: Vec<AttachId>,
    proactive: bool,
}

impl TopicMetadata {
    fn new() -> Self {
        Self {
            state: MetadataState::Required,
            error: None,
            leaders_known: false,
            configs_known: false,
            compacted: false,
            delete_retention_ms: DEFAULT_DELETE_RETENTION_MS,
            leaders: Vec::new(),
            first_offsets: Vec::new(),
            out_of_range: Vec::new(),
            retries: 0,
            refresh_at_us: None,
            pending: Vec::new(),
            proactive: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> MetadataState {
        self.state
    }

    /// Returns true once leaders and configs are known.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == MetadataState::Complete
    }

    /// Returns true if a describe-configs round trip is still needed
    /// after leaders were learned.
    #[must_use]
    pub const fn needs_configs(&self) -> bool {
        self.leaders_known && !self.configs_known
    }

    /// Whether the topic uses log compaction. Meaningful once complete.
    #[must_use]
    pub const fn compacted(&self) -> bool {
        self.compacted
    }

    /// The topic's tombstone retention window in milliseconds.
    #[must_use]
    pub const fn delete_retention_ms(&self) -> u64 {
        self.delete_retention_ms
    }

    /// Number of partitions, zero until metadata was learned.
    #[must_use]
    pub fn partition_count(&self) -> u32 {
        u32::try_from(self.leaders.len()).unwrap_or(u32::MAX)
    }

    /// Leader of one partition, if currently known.
    #[must_use]
    pub fn leader(&self, partition: PartitionId) -> Option<NodeId> {
        self.leaders.get(index(partition)).copied().flatten()
    }

    /// Partitions this topic has, as ids.
    pub fn partition_ids(&self) -> impl Iterator<Item = PartitionId> + '_ {
        (0..self.leaders.len() as u64).map(PartitionId::new)
    }

    /// Earliest retained offset learned for a partition.
    #[must_use]
    pub fn first_offset(&self, partition: PartitionId) -> Offset {
        self.first_offsets
            .get(index(partition))
            .copied()
            .unwrap_or(Offset::new(0))
    }

    /// The bounced request offset awaiting an earliest-offset resolution.
    #[must_use]
    pub fn out_of_range(&self, partition: PartitionId) -> Option<Offset> {
        self.out_of_range.get(index(partition)).copied().flatten()
    }

    /// Consecutive failed refresh attempts.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// When the armed refresh fires, if one is armed.
    #[must_use]
    pub const fn refresh_at_us(&self) -> Option<u64> {
        self.refresh_at_us
    }

    /// Returns true if a proactive route keeps this topic alive.
    #[must_use]
    pub const fn proactive(&self) -> bool {
        self.proactive
    }

    /// Distinct leader nodes across all partitions.
    #[must_use]
    pub fn leader_nodes(&self) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        for node in self.leaders.iter().flatten() {
            if !nodes.contains(node) {
                nodes.push(*node);
            }
        }
        nodes
    }

    fn complete(&mut self) -> Vec<AttachId> {
        self.state = MetadataState::Complete;
        self.error = None;
        self.retries = 0;
        self.refresh_at_us = None;
        std::mem::take(&mut self.pending)
    }

    fn schedule(&mut self, error: KafkaErrorCode, backoff: &Backoff, now_us: u64) -> u64 {
        let delay_ms = backoff.next(self.retries);
        self.retries += 1;
        self.state = MetadataState::Scheduled;
        self.error = Some(error);
        let refresh_at_us = now_us + delay_ms * 1000;
        self.refresh_at_us = Some(refresh_at_us);
        refresh_at_us
    }
}

/// All tracked topics plus the pending attaches waiting on each.
#[derive(Debug, Default)]
pub struct TopicMetadataCatalog {
    topics: HashMap<String, TopicMetadata>,
}

impl TopicMetadataCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a topic.
    #[must_use]
    pub fn get(&self, topic: &str) -> Option<&TopicMetadata> {
        self.topics.get(topic)
    }

    /// Ensures a topic is tracked, creating it in `Required` state.
    pub fn ensure(&mut self, topic: &str) -> &mut TopicMetadata {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(TopicMetadata::new)
    }

    /// Registers an attach waiting for this topic to complete.
    ///
    /// Returns true when the topic is already complete and the attach can
    /// be finalized immediately.
    pub fn register_attach(&mut self, topic: &str, attach: AttachId) -> bool {
        let metadata = self.ensure(topic);
        if metadata.is_complete() {
            true
        } else {
            metadata.pending.push(attach);
            false
        }
    }

    /// Marks a topic as kept alive by a proactive route.
    pub fn mark_proactive(&mut self, topic: &str) {
        self.ensure(topic).proactive = true;
    }

    /// Drops a topic when nothing references it anymore.
    pub fn release_if_unused(&mut self, topic: &str, has_attaches: bool) {
        if let Some(metadata) = self.topics.get(topic) {
            if !has_attaches && !metadata.proactive && metadata.pending.is_empty() {
                self.topics.remove(topic);
                debug!(topic, "topic metadata released");
            }
        }
    }

    /// Removes a topic unconditionally (fatal error path).
    pub fn remove(&mut self, topic: &str) -> Option<TopicMetadata> {
        self.topics.remove(topic)
    }

    /// The next round trip the metadata connection should issue: a topic
    /// in `Required` state and whether it needs leaders or configs.
    #[must_use]
    pub fn next_request(&self) -> Option<(&str, MetadataRequestKind)> {
        self.topics
            .iter()
            .find(|(_, md)| md.state == MetadataState::Required)
            .map(|(name, md)| {
                let kind = if md.needs_configs() {
                    MetadataRequestKind::Configs
                } else {
                    MetadataRequestKind::Leaders
                };
                (name.as_str(), kind)
            })
    }

    /// Schedules a refresh for a topic after a broker-reported error on a
    /// fetch or list-offsets response. Consumers stay attached; fetching
    /// for the topic pauses until the refresh completes.
    ///
    /// Returns when the refresh fires, or `None` when the topic is gone.
    pub fn schedule_refresh(
        &mut self,
        topic: &str,
        error: KafkaErrorCode,
        backoff: &Backoff,
        now_us: u64,
    ) -> Option<u64> {
        let metadata = self.topics.get_mut(topic)?;
        if metadata.state == MetadataState::Scheduled {
            return metadata.refresh_at_us;
        }
        metadata.leaders_known = false;
        let refresh_at_us = metadata.schedule(error, backoff, now_us);
        debug!(topic, ?error, refresh_at_us, "topic refresh scheduled");
        Some(refresh_at_us)
    }

    /// Fires due refresh timers; returns true if any topic flipped back
    /// to `Required`.
    pub fn on_tick(&mut self, now_us: u64) -> bool {
        let mut fired = false;
        for (name, metadata) in &mut self.topics {
            if metadata.state == MetadataState::Scheduled {
                if let Some(at) = metadata.refresh_at_us {
                    if at <= now_us {
                        metadata.state = MetadataState::Required;
                        metadata.leaders_known = false;
                        metadata.refresh_at_us = None;
                        debug!(topic = %name, retries = metadata.retries, "metadata refresh due");
                        fired = true;
                    }
                }
            }
        }
        fired
    }

    /// The earliest armed refresh time across all topics.
    #[must_use]
    pub fn next_refresh_at_us(&self) -> Option<u64> {
        self.topics
            .values()
            .filter_map(|md| md.refresh_at_us)
            .min()
    }

    /// Applies one topic's slice of a metadata response.
    pub fn apply_metadata(
        &mut self,
        topic: &str,
        response: &TopicLeaders,
        backoff: &Backoff,
        now_us: u64,
    ) -> MetadataOutcome {
        let Some(metadata) = self.topics.get_mut(topic) else {
            return MetadataOutcome::Ignored;
        };

        match response.error {
            KafkaErrorCode::None => {}
            error if error.is_fatal() => {
                warn!(topic, ?error, "fatal metadata error, dropping topic");
                let attaches = std::mem::take(&mut metadata.pending);
                self.topics.remove(topic);
                return MetadataOutcome::Failed {
                    error,
                    attaches,
                    reattach: false,
                };
            }
            error => {
                let refresh_at_us = metadata.schedule(error, backoff, now_us);
                debug!(topic, ?error, refresh_at_us, "metadata retry scheduled");
                return MetadataOutcome::Scheduled { error, refresh_at_us };
            }
        }

        // Partition arrays are sized exactly once per topic lifetime.
        if !metadata.leaders.is_empty() && metadata.leaders.len() != response.leaders.len() {
            warn!(
                topic,
                known = metadata.leaders.len(),
                reported = response.leaders.len(),
                "partition count changed, dropping topic"
            );
            let attaches = std::mem::take(&mut metadata.pending);
            self.topics.remove(topic);
            return MetadataOutcome::Failed {
                error: KafkaErrorCode::PartitionCountChanged,
                attaches,
                reattach: true,
            };
        }

        if response.leaders.iter().any(Option::is_none) {
            let error = KafkaErrorCode::LeaderNotAvailable;
            let refresh_at_us = metadata.schedule(error, backoff, now_us);
            return MetadataOutcome::Scheduled { error, refresh_at_us };
        }

        if metadata.leaders.is_empty() {
            metadata.first_offsets = vec![Offset::new(0); response.leaders.len()];
            metadata.out_of_range = vec![None; response.leaders.len()];
        }
        metadata.leaders = response.leaders.clone();
        metadata.leaders_known = true;

        if metadata.configs_known {
            let attaches = metadata.complete();
            debug!(topic, partitions = metadata.leaders.len(), "metadata complete");
            MetadataOutcome::Complete { attaches }
        } else {
            MetadataOutcome::NeedsConfigs
        }
    }

    /// Applies a describe-configs response for one topic.
    pub fn apply_configs(
        &mut self,
        topic: &str,
        error: KafkaErrorCode,
        compacted: bool,
        delete_retention_ms: Option<u64>,
        backoff: &Backoff,
        now_us: u64,
    ) -> MetadataOutcome {
        let Some(metadata) = self.topics.get_mut(topic) else {
            return MetadataOutcome::Ignored;
        };

        if error != KafkaErrorCode::None {
            let refresh_at_us = metadata.schedule(error, backoff, now_us);
            return MetadataOutcome::Scheduled { error, refresh_at_us };
        }

        metadata.configs_known = true;
        metadata.compacted = compacted;
        metadata.delete_retention_ms = delete_retention_ms.unwrap_or(DEFAULT_DELETE_RETENTION_MS);

        if metadata.leaders_known {
            let attaches = metadata.complete();
            debug!(topic, compacted, "configs learned, metadata complete");
            MetadataOutcome::Complete { attaches }
        } else {
            MetadataOutcome::NeedsConfigs
        }
    }

    /// Marks every topic led (in part) by `node` as needing a fresh
    /// metadata round trip. Configs are kept. Returns the affected
    /// topics.
    pub fn invalidate_broker(&mut self, node: NodeId) -> Vec<String> {
        let mut affected = Vec::new();
        for (name, metadata) in &mut self.topics {
            let mut touched = false;
            for leader in &mut metadata.leaders {
                if *leader == Some(node) {
                    *leader = None;
                    touched = true;
                }
            }
            if touched {
                metadata.state = MetadataState::Required;
                metadata.leaders_known = false;
                metadata.refresh_at_us = None;
                affected.push(name.clone());
            }
        }
        if !affected.is_empty() {
            warn!(node_id = %node, topics = affected.len(), "broker invalidated");
        }
        affected
    }

    /// Records a learned earliest offset, advancing monotonically.
    /// Returns true if the stored value moved forward.
    pub fn record_first_offset(
        &mut self,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
    ) -> bool {
        let Some(metadata) = self.topics.get_mut(topic) else {
            return false;
        };
        let Some(slot) = metadata.first_offsets.get_mut(index(partition)) else {
            return false;
        };
        if offset > *slot {
            *slot = offset;
            true
        } else {
            false
        }
    }

    /// Flags a partition whose requested offset bounced out of range.
    pub fn flag_out_of_range(&mut self, topic: &str, partition: PartitionId, requested: Offset) {
        if let Some(metadata) = self.topics.get_mut(topic) {
            if let Some(slot) = metadata.out_of_range.get_mut(index(partition)) {
                *slot = Some(requested);
            }
        }
    }

    /// Clears an out-of-range flag once the earliest offset is known.
    pub fn clear_out_of_range(&mut self, topic: &str, partition: PartitionId) {
        if let Some(metadata) = self.topics.get_mut(topic) {
            if let Some(slot) = metadata.out_of_range.get_mut(index(partition)) {
                *slot = None;
            }
        }
    }

    /// Iterates tracked topics.
    pub fn topics(&self) -> impl Iterator<Item = (&str, &TopicMetadata)> {
        self.topics.iter().map(|(name, md)| (name.as_str(), md))
    }

    /// Number of tracked topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Returns true if no topics are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

fn index(partition: PartitionId) -> usize {
    usize::try_from(partition.get()).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaders(nodes: &[u64]) -> TopicLeaders {
        TopicLeaders {
            error: KafkaErrorCode::None,
            leaders: nodes.iter().map(|n| Some(NodeId::new(*n))).collect(),
        }
    }

    fn complete_topic(catalog: &mut TopicMetadataCatalog, topic: &str, nodes: &[u64]) {
        catalog.ensure(topic);
        let outcome = catalog.apply_metadata(topic, &leaders(nodes), &Backoff::default(), 0);
        assert_eq!(outcome, MetadataOutcome::NeedsConfigs);
        let outcome = catalog.apply_configs(
            topic,
            KafkaErrorCode::None,
            false,
            None,
            &Backoff::default(),
            0,
        );
        assert!(matches!(outcome, MetadataOutcome::Complete { .. }));
    }

    #[test]
    fn test_completes_after_metadata_and_configs() {
        let mut catalog = TopicMetadataCatalog::new();
        let waiting = catalog.register_attach("orders", AttachId::new(7));
        assert!(!waiting);

        let outcome =
            catalog.apply_metadata("orders", &leaders(&[1, 2]), &Backoff::default(), 0);
        assert_eq!(outcome, MetadataOutcome::NeedsConfigs);
        assert!(!catalog.get("orders").unwrap().is_complete());

        let outcome = catalog.apply_configs(
            "orders",
            KafkaErrorCode::None,
            true,
            Some(1000),
            &Backoff::default(),
            0,
        );
        assert_eq!(
            outcome,
            MetadataOutcome::Complete {
                attaches: vec![AttachId::new(7)]
            }
        );

        let metadata = catalog.get("orders").unwrap();
        assert!(metadata.is_complete());
        assert!(metadata.compacted());
        assert_eq!(metadata.delete_retention_ms(), 1000);
        assert_eq!(metadata.leader(PartitionId::new(1)), Some(NodeId::new(2)));
        assert_eq!(metadata.retries(), 0);

        // Late attach on a complete topic finalizes immediately.
        assert!(catalog.register_attach("orders", AttachId::new(8)));
    }

    #[test]
    fn test_recoverable_error_schedules_with_growing_backoff() {
        let mut catalog = TopicMetadataCatalog::new();
        catalog.ensure("orders");

        let response = TopicLeaders {
            error: KafkaErrorCode::LeaderNotAvailable,
            leaders: Vec::new(),
        };
        let backoff = Backoff::new(10, 10_000);

        let MetadataOutcome::Scheduled { refresh_at_us, .. } =
            catalog.apply_metadata("orders", &response, &backoff, 0)
        else {
            panic!("expected scheduled");
        };
        assert_eq!(refresh_at_us, 10_000);

        // Timer fires, second attempt fails: longer delay.
        assert!(catalog.on_tick(refresh_at_us));
        let MetadataOutcome::Scheduled { refresh_at_us, .. } =
            catalog.apply_metadata("orders", &response, &backoff, 10_000)
        else {
            panic!("expected scheduled");
        };
        assert_eq!(refresh_at_us, 10_000 + 20_000);
        assert_eq!(catalog.get("orders").unwrap().retries(), 2);
    }

    #[test]
    fn test_retries_reset_only_on_complete() {
        let mut catalog = TopicMetadataCatalog::new();
        catalog.ensure("orders");
        let backoff = Backoff::default();

        let response = TopicLeaders {
            error: KafkaErrorCode::UnknownTopicOrPartition,
            leaders: Vec::new(),
        };
        catalog.apply_metadata("orders", &response, &backoff, 0);
        catalog.on_tick(u64::MAX);
        assert_eq!(catalog.get("orders").unwrap().retries(), 1);

        complete_topic(&mut catalog, "orders", &[1]);
        assert_eq!(catalog.get("orders").unwrap().retries(), 0);
    }

    #[test]
    fn test_invalid_topic_is_fatal() {
        let mut catalog = TopicMetadataCatalog::new();
        catalog.register_attach("bad topic", AttachId::new(1));

        let response = TopicLeaders {
            error: KafkaErrorCode::InvalidTopic,
            leaders: Vec::new(),
        };
        let outcome = catalog.apply_metadata("bad topic", &response, &Backoff::default(), 0);
        assert_eq!(
            outcome,
            MetadataOutcome::Failed {
                error: KafkaErrorCode::InvalidTopic,
                attaches: vec![AttachId::new(1)],
                reattach: false,
            }
        );
        assert!(catalog.get("bad topic").is_none());
    }

    #[test]
    fn test_partition_count_change_is_fatal_with_reattach() {
        let mut catalog = TopicMetadataCatalog::new();
        complete_topic(&mut catalog, "orders", &[1, 2]);

        // Broker drops, topic re-fetched, now three partitions.
        catalog.invalidate_broker(NodeId::new(1));
        catalog.register_attach("orders", AttachId::new(9));
        let outcome =
            catalog.apply_metadata("orders", &leaders(&[1, 2, 3]), &Backoff::default(), 0);
        assert_eq!(
            outcome,
            MetadataOutcome::Failed {
                error: KafkaErrorCode::PartitionCountChanged,
                attaches: vec![AttachId::new(9)],
                reattach: true,
            }
        );
    }

    #[test]
    fn test_unknown_leader_retries() {
        let mut catalog = TopicMetadataCatalog::new();
        catalog.ensure("orders");
        let response = TopicLeaders {
            error: KafkaErrorCode::None,
            leaders: vec![Some(NodeId::new(1)), None],
        };
        let outcome = catalog.apply_metadata("orders", &response, &Backoff::default(), 0);
        assert!(matches!(
            outcome,
            MetadataOutcome::Scheduled {
                error: KafkaErrorCode::LeaderNotAvailable,
                ..
            }
        ));
    }

    #[test]
    fn test_invalidate_broker_keeps_configs() {
        let mut catalog = TopicMetadataCatalog::new();
        complete_topic(&mut catalog, "orders", &[1, 2]);

        let affected = catalog.invalidate_broker(NodeId::new(2));
        assert_eq!(affected, vec!["orders".to_string()]);

        let metadata = catalog.get("orders").unwrap();
        assert_eq!(metadata.state(), MetadataState::Required);
        assert_eq!(metadata.leader(PartitionId::new(1)), None);
        assert_eq!(metadata.leader(PartitionId::new(0)), Some(NodeId::new(1)));
        assert!(!metadata.needs_configs() || metadata.configs_known);

        // Re-learning leaders completes without another configs fetch.
        let outcome =
            catalog.apply_metadata("orders", &leaders(&[1, 3]), &Backoff::default(), 0);
        assert!(matches!(outcome, MetadataOutcome::Complete { .. }));
    }

    #[test]
    fn test_first_offset_advances_monotonically() {
        let mut catalog = TopicMetadataCatalog::new();
        complete_topic(&mut catalog, "orders", &[1]);
        let p = PartitionId::new(0);

        assert!(catalog.record_first_offset("orders", p, Offset::new(80)));
        assert!(!catalog.record_first_offset("orders", p, Offset::new(50)));
        assert_eq!(catalog.get("orders").unwrap().first_offset(p), Offset::new(80));
    }

    #[test]
    fn test_out_of_range_flag_round_trip() {
        let mut catalog = TopicMetadataCatalog::new();
        complete_topic(&mut catalog, "orders", &[1]);
        let p = PartitionId::new(0);

        catalog.flag_out_of_range("orders", p, Offset::new(50));
        assert_eq!(catalog.get("orders").unwrap().out_of_range(p), Some(Offset::new(50)));
        catalog.clear_out_of_range("orders", p);
        assert_eq!(catalog.get("orders").unwrap().out_of_range(p), None);
    }

    #[test]
    fn test_release_if_unused_respects_proactive() {
        let mut catalog = TopicMetadataCatalog::new();
        catalog.mark_proactive("orders");
        catalog.release_if_unused("orders", false);
        assert!(catalog.get("orders").is_some());

        catalog.ensure("transient");
        catalog.release_if_unused("transient", false);
        assert!(catalog.get("transient").is_none());
    }
}
