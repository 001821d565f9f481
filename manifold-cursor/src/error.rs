//! Cursor bookkeeping errors.
//!
//! These indicate a prior bookkeeping bug, not a transient condition:
//! callers abort the affected subscription instead of retrying.

use manifold_core::{Offset, PartitionId};
use thiserror::Error;

/// Errors from checkpoint bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CursorError {
    /// No checkpoint exists at the exact expected position.
    #[error("no checkpoint at {partition} offset {offset}")]
    CheckpointMissing {
        /// The partition that was addressed.
        partition: PartitionId,
        /// The offset expected to hold a checkpoint.
        offset: Offset,
    },

    /// A checkpoint holds fewer references than the caller released.
    #[error("checkpoint at {partition} offset {offset} holds {held} refs, needed {needed}")]
    RefUnderflow {
        /// The partition that was addressed.
        partition: PartitionId,
        /// The checkpoint offset.
        offset: Offset,
        /// References the checkpoint actually holds.
        held: u32,
        /// References the caller tried to release.
        needed: u32,
    },
}
