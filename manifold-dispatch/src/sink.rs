//! Sink contract and the registry arena that owns sinks.

use std::collections::HashMap;

use manifold_core::{Headers, Offset, PartitionId, SinkId};

use crate::flags::DispatchFlags;

/// Borrowed view of one record plus its fetch context, handed to sinks.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    /// Partition the record came from.
    pub partition: PartitionId,
    /// The offset the fetch request asked for (start of the batch).
    pub request_offset: Offset,
    /// Absolute offset of this record.
    pub message_offset: Offset,
    /// Record timestamp in milliseconds.
    pub timestamp: i64,
    /// Trace id of the carrying response, for log correlation.
    pub trace_id: u64,
    /// Record key bytes, if the record has a key.
    pub key: Option<&'a [u8]>,
    /// Record headers.
    pub headers: &'a Headers,
    /// Record value bytes. `None` is a tombstone.
    pub value: Option<&'a [u8]>,
}

/// Progress reported by one sink at a batch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkProgress {
    /// Offset the sink was previously positioned at.
    pub old_offset: Offset,
    /// Offset the sink has now fully consumed up to.
    pub new_offset: Offset,
}

/// One attached consumer's delivery endpoint.
///
/// Implementations are driven entirely by the fetch pool: `dispatch` per
/// matching record, `flush` once per batch boundary, `adjust_offset` when
/// a live-tail subscription is rebased onto a concrete offset, and
/// `detached` when the pool force-detaches the consumer.
pub trait MessageSink {
    /// Offers one record. Returns what happened.
    fn dispatch(&mut self, ctx: &DispatchContext<'_>) -> DispatchFlags;

    /// Finalizes a batch; returns how far this sink's position advanced.
    fn flush(
        &mut self,
        partition: PartitionId,
        request_offset: Offset,
        last_offset: Offset,
    ) -> Option<SinkProgress>;

    /// Silently rebases bookkeeping from `old_offset` to `new_offset`.
    fn adjust_offset(&mut self, partition: PartitionId, old_offset: Offset, new_offset: Offset) {
        let _ = (partition, old_offset, new_offset);
    }

    /// The pool is force-detaching this sink. When `reattach` is true the
    /// consumer should re-attach at offset zero (topic was recreated).
    fn detached(&mut self, reattach: bool) {
        let _ = reattach;
    }

    /// Bytes of downstream window currently available to this sink.
    ///
    /// This poll is the pool's back-pressure channel: per-partition
    /// fetch sizes are shaped by the smallest non-zero window, and a
    /// zero window stalls the partition until it refreshes. The
    /// [`DispatchFlags::EXPECTING_WINDOW`] flag a `dispatch` may return
    /// is informational and does not gate fetching by itself.
    fn window_bytes(&self) -> u32 {
        u32::MAX
    }
}

/// Arena of sinks keyed by [`SinkId`].
///
/// The dispatch tree stores ids only; every call path resolves a sink
/// through this registry, so sinks have exactly one owner.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: HashMap<SinkId, Box<dyn MessageSink>>,
    next_id: SinkId,
}

impl SinkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink and returns its id.
    pub fn register(&mut self, sink: Box<dyn MessageSink>) -> SinkId {
        let id = self.next_id;
        self.next_id = self.next_id.next();
        self.sinks.insert(id, sink);
        id
    }

    /// Removes and returns a sink.
    pub fn remove(&mut self, id: SinkId) -> Option<Box<dyn MessageSink>> {
        self.sinks.remove(&id)
    }

    /// Resolves a sink for mutation.
    pub fn get_mut(&mut self, id: SinkId) -> Option<&mut dyn MessageSink> {
        self.sinks.get_mut(&id).map(|sink| sink.as_mut() as _)
    }

    /// Resolves a sink for inspection.
    #[must_use]
    pub fn get(&self, id: SinkId) -> Option<&dyn MessageSink> {
        self.sinks.get(&id).map(|sink| sink.as_ref() as _)
    }

    /// Returns the number of registered sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns true if no sinks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

/// Decorator that reports progress proactively at every batch boundary.
///
/// A plain sink only advances when it delivers bytes downstream. Cached
/// reads and filtered-out records still move the fetch position, so this
/// wrapper tracks the highest flushed offset per partition and reports
/// the delta even when the inner sink reported nothing.
pub struct ProgressSink {
    inner: Box<dyn MessageSink>,
    reported: HashMap<PartitionId, Offset>,
}

impl ProgressSink {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Box<dyn MessageSink>) -> Self {
        Self {
            inner,
            reported: HashMap::new(),
        }
    }

    /// Wraps `inner` with known starting positions per partition, so the
    /// first progress report starts from where the consumer attached
    /// rather than from the batch boundary.
    #[must_use]
    pub fn with_positions(
        inner: Box<dyn MessageSink>,
        positions: impl IntoIterator<Item = (PartitionId, Offset)>,
    ) -> Self {
        Self {
            inner,
            reported: positions.into_iter().collect(),
        }
    }
}

impl MessageSink for ProgressSink {
    fn dispatch(&mut self, ctx: &DispatchContext<'_>) -> DispatchFlags {
        // Batches are shared between consumers at different positions. A
        // record is consumable only when the batch covers this sink's
        // position with no gap and the record is not already consumed.
        if let Some(&position) = self.reported.get(&ctx.partition) {
            if ctx.request_offset > position || ctx.message_offset < position {
                return DispatchFlags::EMPTY;
            }
        }
        self.inner.dispatch(ctx)
    }

    fn flush(
        &mut self,
        partition: PartitionId,
        request_offset: Offset,
        last_offset: Offset,
    ) -> Option<SinkProgress> {
        let old_offset = self
            .reported
            .get(&partition)
            .copied()
            .unwrap_or(request_offset);
        // A batch starting past this sink's position advances somebody
        // else; consuming it here would skip the gap.
        if old_offset < request_offset {
            return None;
        }

        // Inner progress is authoritative when present; otherwise the
        // batch boundary itself is the new position.
        let inner = self.inner.flush(partition, request_offset, last_offset);
        let new_offset = inner.map_or(last_offset, |p| p.new_offset);

        if new_offset > old_offset {
            self.reported.insert(partition, new_offset);
            Some(SinkProgress {
                old_offset,
                new_offset,
            })
        } else {
            self.reported.insert(partition, old_offset);
            None
        }
    }

    fn adjust_offset(&mut self, partition: PartitionId, old_offset: Offset, new_offset: Offset) {
        if let Some(reported) = self.reported.get_mut(&partition) {
            if *reported == old_offset {
                *reported = new_offset;
            }
        }
        self.inner.adjust_offset(partition, old_offset, new_offset);
    }

    fn detached(&mut self, reattach: bool) {
        self.inner.detached(reattach);
    }

    fn window_bytes(&self) -> u32 {
        self.inner.window_bytes()
    }
}
