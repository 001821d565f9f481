//! Error types for Manifold core operations.
//!
//! Following `TigerStyle`: all errors must be handled explicitly.
//! No silent failures, no ignored errors.

use std::fmt;

/// The result type for Manifold core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Manifold core operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A resource limit was exceeded.
    LimitExceeded {
        /// Which limit was exceeded.
        limit: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The actual value that exceeded the limit.
        actual: u64,
    },

    /// An invalid argument was provided.
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: &'static str,
    },

    /// The requested resource was not found.
    NotFound {
        /// The type of resource.
        resource: &'static str,
        /// An identifier for the resource.
        id: u64,
    },

    /// The operation is not permitted in the current state.
    InvalidState {
        /// The current state.
        current: &'static str,
        /// The required state for this operation.
        required: &'static str,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LimitExceeded { limit, max, actual } => {
                write!(f, "limit exceeded: {limit} (max={max}, actual={actual})")
            }
            Self::InvalidArgument { name, reason } => {
                write!(f, "invalid argument '{name}': {reason}")
            }
            Self::NotFound { resource, id } => {
                write!(f, "{resource} not found: {id}")
            }
            Self::InvalidState { current, required } => {
                write!(f, "invalid state: in {current}, need {required}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Broker-reported error codes, classified for retry policy.
///
/// Only the codes this core reacts to get their own variant; everything
/// else is carried through as [`KafkaErrorCode::Unknown`] and treated as
/// recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KafkaErrorCode {
    /// No error.
    None,
    /// The requested offset is outside the range the broker retains.
    OffsetOutOfRange,
    /// The topic or partition does not exist (possibly transiently).
    UnknownTopicOrPartition,
    /// The partition leader is not yet available.
    LeaderNotAvailable,
    /// The addressed broker is no longer the leader for the partition.
    NotLeaderForPartition,
    /// The topic name is invalid.
    InvalidTopic,
    /// The principal is not authorized to read the topic.
    TopicAuthorizationFailed,
    /// The topic was recreated with a different partition count.
    ///
    /// Synthesized locally, never decoded from the wire.
    PartitionCountChanged,
    /// Any other broker error code.
    Unknown(i16),
}

impl KafkaErrorCode {
    /// Maps a wire error code to a classified variant.
    #[must_use]
    pub const fn from_code(code: i16) -> Self {
        match code {
            0 => Self::None,
            1 => Self::OffsetOutOfRange,
            3 => Self::UnknownTopicOrPartition,
            5 => Self::LeaderNotAvailable,
            6 => Self::NotLeaderForPartition,
            17 => Self::InvalidTopic,
            29 => Self::TopicAuthorizationFailed,
            other => Self::Unknown(other),
        }
    }

    /// Returns the wire error code, if this variant has one.
    #[must_use]
    pub const fn code(self) -> Option<i16> {
        match self {
            Self::None => Some(0),
            Self::OffsetOutOfRange => Some(1),
            Self::UnknownTopicOrPartition => Some(3),
            Self::LeaderNotAvailable => Some(5),
            Self::NotLeaderForPartition => Some(6),
            Self::InvalidTopic => Some(17),
            Self::TopicAuthorizationFailed => Some(29),
            Self::PartitionCountChanged => None,
            Self::Unknown(code) => Some(code),
        }
    }

    /// Returns true if the error is retried with backoff while consumers
    /// stay attached.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::LeaderNotAvailable
                | Self::NotLeaderForPartition
                | Self::UnknownTopicOrPartition
                | Self::TopicAuthorizationFailed
                | Self::Unknown(_)
        )
    }

    /// Returns true if the error forces consumers to be detached.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::InvalidTopic | Self::PartitionCountChanged)
    }
}
