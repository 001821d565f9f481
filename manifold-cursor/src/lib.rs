//! Manifold Cursor - reference-counted offset checkpoints per partition.
//!
//! Every attached consumer is positioned at exactly one offset per
//! partition. A *checkpoint* is a `(partition, offset)` pair counting how
//! many consumers sit there. The set decides which partitions can be
//! served by tailing the live stream and which need historical reads
//! because someone fell behind the highest position.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod set;

pub use error::CursorError;
pub use set::{AttachOutcome, PartitionCursorSet};
