//! Strongly-typed identifiers for Manifold entities.
//!
//! Following `TigerStyle`: explicit types prevent bugs from mixing up IDs.
//! All IDs are 64-bit to handle large-scale deployments.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `NodeId` with `PartitionId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Cluster topology.
define_id!(NodeId, "node", "Unique identifier for a broker node in the cluster.");
define_id!(PartitionId, "partition", "Identifier for a partition within a topic.");

// Consumer tracking.
define_id!(AttachId, "attach", "Identifier for one consumer attachment to a topic.");
define_id!(SinkId, "sink", "Identifier for a registered message sink.");

// Connection bookkeeping.
define_id!(ConnectionId, "conn", "Identifier for a physical broker connection slot.");
define_id!(CorrelationId, "corr", "Correlation id carried in a request/response pair.");

/// A position in a partition's log.
///
/// Offsets are non-negative and dense within a partition. The value
/// [`Offset::LIVE`] is a sentinel meaning "the unresolved live tail": a
/// consumer positioned there tracks the broker's high-water mark, which is
/// only learned through a list-offsets round trip.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Offset(u64);

impl Offset {
    /// Sentinel for an unresolved live-tail position.
    pub const LIVE: Self = Self(u64::MAX);

    /// Creates an offset from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true if this is the live-tail sentinel.
    #[inline]
    #[must_use]
    pub const fn is_live(self) -> bool {
        self.0 == u64::MAX
    }

    /// Returns the offset of the following record.
    ///
    /// # Panics
    /// Panics if called on the live-tail sentinel.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        assert!(self.0 < u64::MAX - 1, "offset overflow");
        Self(self.0 + 1)
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_live() {
            write!(f, "offset(live)")
        } else {
            write!(f, "offset({})", self.0)
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_live() {
            write!(f, "live")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl From<Offset> for u64 {
    fn from(offset: Offset) -> Self {
        offset.get()
    }
}
