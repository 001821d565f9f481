//! The checkpoint set for one topic.

use std::collections::BTreeMap;

use manifold_core::{Offset, PartitionId};
use roaring::RoaringBitmap;
use tracing::debug;

use crate::error::CursorError;

/// Result of attaching references at an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOutcome {
    /// The offset the references actually landed on.
    pub effective_offset: Offset,
    /// Set when a live-tail request was rebased onto an already-resolved
    /// live checkpoint; holds the offset originally requested. The caller
    /// must propagate the rebase to its dispatch bookkeeping.
    pub rebased_from: Option<Offset>,
}

/// Reference-counted, offset-ordered checkpoints for one topic.
///
/// Ordering is lexicographic on `(partition, offset)`, so a predecessor
/// query on `(p, Offset::LIVE)` yields partition `p`'s highest checkpoint.
///
/// Two partition bitmaps are maintained alongside:
/// - `needs_historical`: the partition has a checkpoint strictly behind
///   its highest one, so a historical connection must serve it. Invariant:
///   set exactly when the partition holds two or more checkpoints.
/// - `live`: the partition's highest checkpoint tracks the broker's tail.
#[derive(Debug, Default)]
pub struct PartitionCursorSet {
    checkpoints: BTreeMap<(PartitionId, Offset), u32>,
    needs_historical: RoaringBitmap,
    live: RoaringBitmap,
}

impl PartitionCursorSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions `ref_delta` new references at `offset` on `partition`.
    ///
    /// A live-tail request joins the partition's existing live checkpoint
    /// when one exists; the returned outcome says where the references
    /// ended up.
    ///
    /// # Panics
    /// Panics if `ref_delta` is zero.
    pub fn attach(
        &mut self,
        partition: PartitionId,
        offset: Offset,
        ref_delta: u32,
    ) -> AttachOutcome {
        assert!(ref_delta > 0, "ref_delta must be positive");

        let mut target = offset;
        if offset.is_live() && self.is_live(partition) {
            if let Some((highest, _)) = self.highest(partition) {
                target = highest;
            }
        }
        let rebased_from = (target != offset).then_some(offset);

        if let Some(refs) = self.checkpoints.get_mut(&(partition, target)) {
            *refs += ref_delta;
        } else {
            let has_other = self.checkpoints_for(partition).next().is_some();
            self.set_needs_historical(partition, has_other);
            self.checkpoints.insert((partition, target), ref_delta);
            if offset.is_live() {
                self.live.insert(bit(partition));
            }
        }

        debug!(
            partition = %partition,
            offset = %target,
            refs = ref_delta,
            rebased = rebased_from.is_some(),
            "cursor attach"
        );
        AttachOutcome {
            effective_offset: target,
            rebased_from,
        }
    }

    /// Moves `refs` references from `old` to `new` after a completed
    /// fetch round.
    ///
    /// # Errors
    /// Fails when no checkpoint sits exactly at `old` or it holds fewer
    /// than `refs` references; either means the caller's bookkeeping
    /// diverged and the subscription must be aborted.
    pub fn advance(
        &mut self,
        partition: PartitionId,
        old: Offset,
        new: Offset,
        refs: u32,
    ) -> Result<(), CursorError> {
        self.release(partition, old, refs)?;
        *self.checkpoints.entry((partition, new)).or_insert(0) += refs;
        self.refresh_needs_historical(partition);
        Ok(())
    }

    /// Removes `ref_delta` references positioned at `offset`.
    ///
    /// # Errors
    /// Fails when no checkpoint sits exactly at `offset` or it holds
    /// fewer references than released.
    pub fn detach(
        &mut self,
        partition: PartitionId,
        offset: Offset,
        ref_delta: u32,
    ) -> Result<(), CursorError> {
        self.release(partition, offset, ref_delta)?;
        self.refresh_needs_historical(partition);

        if self.is_live(partition) {
            // If the removed checkpoint was the highest, the survivors sit
            // strictly behind the tail and the live tag no longer holds.
            match self.highest(partition) {
                Some((highest, _)) if highest < offset => {
                    self.live.remove(bit(partition));
                }
                None => {
                    self.live.remove(bit(partition));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Resolves a partition's live-tail sentinel to a concrete offset
    /// learned from a list-offsets round trip.
    ///
    /// Returns the `(old, new)` pair the caller must forward to its
    /// dispatch bookkeeping, or `None` when there is nothing to resolve.
    pub fn set_live_offset(
        &mut self,
        partition: PartitionId,
        offset: Offset,
    ) -> Option<(Offset, Offset)> {
        if !self.is_live(partition) {
            return None;
        }
        let refs = self.checkpoints.remove(&(partition, Offset::LIVE))?;
        *self.checkpoints.entry((partition, offset)).or_insert(0) += refs;
        self.refresh_needs_historical(partition);
        debug!(partition = %partition, offset = %offset, refs, "live offset resolved");
        Some((Offset::LIVE, offset))
    }

    /// The partition's highest checkpoint, if any.
    #[must_use]
    pub fn highest(&self, partition: PartitionId) -> Option<(Offset, u32)> {
        self.checkpoints
            .range(..=(partition, Offset::LIVE))
            .next_back()
            .filter(|((p, _), _)| *p == partition)
            .map(|((_, offset), refs)| (*offset, *refs))
    }

    /// The partition's lowest checkpoint, if any.
    #[must_use]
    pub fn lowest(&self, partition: PartitionId) -> Option<(Offset, u32)> {
        self.checkpoints_for(partition).next()
    }

    /// References currently held at an exact position.
    #[must_use]
    pub fn refs_at(&self, partition: PartitionId, offset: Offset) -> Option<u32> {
        self.checkpoints.get(&(partition, offset)).copied()
    }

    /// Checkpoints for `partition` in ascending offset order.
    pub fn checkpoints_for(
        &self,
        partition: PartitionId,
    ) -> impl Iterator<Item = (Offset, u32)> + '_ {
        self.checkpoints
            .range((partition, Offset::new(0))..=(partition, Offset::LIVE))
            .map(|((_, offset), refs)| (*offset, *refs))
    }

    /// Checkpoints for `partition` strictly below `offset`.
    #[must_use]
    pub fn checkpoints_below(&self, partition: PartitionId, offset: Offset) -> Vec<(Offset, u32)> {
        self.checkpoints_for(partition)
            .take_while(|(o, _)| *o < offset)
            .collect()
    }

    /// Distinct partitions that hold at least one checkpoint.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        let mut last: Option<PartitionId> = None;
        self.checkpoints.keys().filter_map(move |(p, _)| {
            if last == Some(*p) {
                None
            } else {
                last = Some(*p);
                Some(*p)
            }
        })
    }

    /// Returns true if the partition needs historical service.
    #[must_use]
    pub fn needs_historical(&self, partition: PartitionId) -> bool {
        self.needs_historical.contains(bit(partition))
    }

    /// Returns true if any partition needs historical service.
    #[must_use]
    pub fn any_needs_historical(&self) -> bool {
        !self.needs_historical.is_empty()
    }

    /// Partitions currently flagged for historical service.
    pub fn historical_partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.needs_historical.iter().map(|p| PartitionId::new(u64::from(p)))
    }

    /// Returns true if the partition's highest checkpoint tracks the tail.
    #[must_use]
    pub fn is_live(&self, partition: PartitionId) -> bool {
        self.live.contains(bit(partition))
    }

    /// Returns true if no checkpoints exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Total number of checkpoints across all partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    fn release(
        &mut self,
        partition: PartitionId,
        offset: Offset,
        refs: u32,
    ) -> Result<(), CursorError> {
        let Some(held) = self.checkpoints.get_mut(&(partition, offset)) else {
            return Err(CursorError::CheckpointMissing { partition, offset });
        };
        if *held < refs {
            return Err(CursorError::RefUnderflow {
                partition,
                offset,
                held: *held,
                needed: refs,
            });
        }
        *held -= refs;
        if *held == 0 {
            self.checkpoints.remove(&(partition, offset));
        }
        Ok(())
    }

    /// Re-derives the historical flag for one partition. The flag holds
    /// exactly when a second checkpoint sits behind the highest one;
    /// neighboring partitions never influence it.
    fn refresh_needs_historical(&mut self, partition: PartitionId) {
        let behind = self.checkpoints_for(partition).nth(1).is_some();
        self.set_needs_historical(partition, behind);
    }

    fn set_needs_historical(&mut self, partition: PartitionId, value: bool) {
        if value {
            self.needs_historical.insert(bit(partition));
        } else {
            self.needs_historical.remove(bit(partition));
        }
    }
}

/// Partition ids index the roaring bitmaps, which are 32-bit.
fn bit(partition: PartitionId) -> u32 {
    let raw = partition.get();
    assert!(raw <= u64::from(u32::MAX), "partition id out of bitmap range");
    #[allow(clippy::cast_possible_truncation)]
    {
        raw as u32
    }
}
