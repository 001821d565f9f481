//! Manifold Dispatch - routing decoded records to attached consumers.
//!
//! A record arriving from a fetch response must reach exactly the
//! consumers whose filters match it: an optional partition-key filter
//! (exact byte equality) and an optional set of required headers
//! (every required name must match, any value under a name suffices).
//!
//! The tree has three levels: an unkeyed root, one branch per exact key,
//! and header-chain nodes below either. Leaves are [`SinkId`]s resolved
//! through a [`SinkRegistry`] arena, so no consumer state is aliased by
//! the tree itself.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod flags;
mod sink;
mod tree;

pub use flags::DispatchFlags;
pub use sink::{DispatchContext, MessageSink, ProgressSink, SinkProgress, SinkRegistry};
pub use tree::DispatchTree;
