//! Transport seam between the pool and the network runtime.
//!
//! The pool never touches sockets. It asks the transport to open,
//! write, credit, and tear down connections by id, and the runtime
//! reports back through the pool's `on_*` event methods.

use bytes::Bytes;
use manifold_core::ConnectionId;
use manifold_metadata::BrokerMetadata;

use crate::error::FetchError;

/// Network operations the pool drives.
///
/// All methods are fire-and-forget from the pool's point of view:
/// completion and failure arrive later as events. `connect` may fail
/// synchronously when the runtime cannot even start the attempt.
pub trait Transport {
    /// Starts connecting the slot to a broker.
    ///
    /// Completion is reported via `FetchPool::on_connected`, failure via
    /// `FetchPool::on_disconnected`.
    ///
    /// # Errors
    /// Fails if the attempt cannot be initiated.
    fn connect(&mut self, connection: ConnectionId, broker: &BrokerMetadata)
        -> Result<(), FetchError>;

    /// Writes one encoded request frame.
    ///
    /// # Errors
    /// Fails if the slot is not writable.
    fn send(&mut self, connection: ConnectionId, frame: Bytes) -> Result<(), FetchError>;

    /// Grants the peer additional response budget.
    fn credit(&mut self, connection: ConnectionId, bytes: u32);

    /// Abandons the slot without a clean shutdown.
    fn abort(&mut self, connection: ConnectionId);

    /// Closes the slot cleanly.
    fn close(&mut self, connection: ConnectionId);
}
