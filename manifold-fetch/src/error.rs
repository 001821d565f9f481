//! Error types for the fetch coordinator.

use manifold_core::{AttachId, ConnectionId, CorrelationId};
use thiserror::Error;

/// Errors from the fetch pool and its collaborators.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The wire codec failed to encode or decode a payload.
    #[error("codec: {message}")]
    Codec {
        /// What went wrong.
        message: String,
    },

    /// The transport refused an operation.
    #[error("transport: {message}")]
    Transport {
        /// What went wrong.
        message: String,
    },

    /// A response frame advertised more bytes than allowed.
    #[error("frame of {length} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Advertised frame length.
        length: u64,
        /// Configured maximum.
        max: u32,
    },

    /// A response frame was too short to carry its header.
    #[error("response frame of {length} bytes is too short")]
    TruncatedFrame {
        /// Bytes actually present.
        length: usize,
    },

    /// A response arrived whose correlation id does not match the one
    /// request in flight on its connection.
    #[error("response correlation {actual} does not match in-flight {expected}")]
    CorrelationMismatch {
        /// Correlation id of the request in flight.
        expected: CorrelationId,
        /// Correlation id the response carried.
        actual: CorrelationId,
    },

    /// Data arrived for a connection the pool does not track.
    #[error("unknown connection {connection}")]
    UnknownConnection {
        /// The unknown connection id.
        connection: ConnectionId,
    },

    /// A response arrived on a connection with nothing in flight.
    #[error("no request in flight on connection {connection}")]
    NoRequestInFlight {
        /// The connection the response arrived on.
        connection: ConnectionId,
    },

    /// An operation referenced an attach id the pool does not track.
    #[error("unknown attach {attach}")]
    UnknownAttach {
        /// The unknown attach id.
        attach: AttachId,
    },

    /// Cursor bookkeeping diverged; the affected subscription is aborted.
    #[error(transparent)]
    Cursor(#[from] manifold_cursor::CursorError),

    /// Invalid configuration or argument.
    #[error(transparent)]
    Core(#[from] manifold_core::Error),
}
