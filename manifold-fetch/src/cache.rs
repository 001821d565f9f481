//! Per-topic record cache seam.
//!
//! Fetched records are offered to a cache before dispatch so that
//! bootstrapping consumers can replay retained history without another
//! broker round trip. The pool owns when to write and when to read; the
//! cache owns retention policy.

use manifold_core::{Headers, Offset, PartitionId, Record};

/// One fetched record offered to the cache.
///
/// Bundles the dispatch coordinates alongside the record payload so the
/// cache can decide whether to retain it.
#[derive(Debug, Clone, Copy)]
pub struct CacheWrite<'a> {
    /// Partition the record came from.
    pub partition: PartitionId,
    /// The offset the enclosing fetch asked for.
    pub request_offset: Offset,
    /// The record's own offset.
    pub message_offset: Offset,
    /// The record's timestamp, in milliseconds.
    pub timestamp: i64,
    /// Trace id carried through from the fetch exchange.
    pub trace_id: u64,
    /// Record key, if present.
    pub key: Option<&'a [u8]>,
    /// Record headers.
    pub headers: &'a Headers,
    /// Record value, `None` for a tombstone.
    pub value: Option<&'a [u8]>,
    /// True when the entry should only be written if its key is not
    /// already cached at a later offset.
    pub cache_if_new: bool,
}

/// Retained history for one topic.
pub trait TopicCache {
    /// Offers a fetched record.
    fn add(&mut self, write: &CacheWrite<'_>);

    /// Iterates retained entries for a partition at or after `from`.
    fn entries(
        &self,
        partition: PartitionId,
        from: Offset,
    ) -> Box<dyn Iterator<Item = Record> + '_>;

    /// Records that the partition is contiguous up to `next_offset`
    /// even when no records arrived in between.
    fn extend_next_offset(
        &mut self,
        partition: PartitionId,
        request_offset: Offset,
        next_offset: Offset,
    );

    /// The first offset past the retained entries, if any are held.
    fn live_offset(&self, partition: PartitionId) -> Option<Offset>;

    /// Drops retained entries below the broker's log start offset.
    fn start_offset(&mut self, partition: PartitionId, offset: Offset);
}

/// A cache that retains nothing.
///
/// Used for topics without compaction, where replaying history from the
/// broker is as good as replaying it locally.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTopicCache;

impl TopicCache for NullTopicCache {
    fn add(&mut self, _write: &CacheWrite<'_>) {}

    fn entries(
        &self,
        _partition: PartitionId,
        _from: Offset,
    ) -> Box<dyn Iterator<Item = Record> + '_> {
        Box::new(std::iter::empty())
    }

    fn extend_next_offset(
        &mut self,
        _partition: PartitionId,
        _request_offset: Offset,
        _next_offset: Offset,
    ) {
    }

    fn live_offset(&self, _partition: PartitionId) -> Option<Offset> {
        None
    }

    fn start_offset(&mut self, _partition: PartitionId, _offset: Offset) {}
}
