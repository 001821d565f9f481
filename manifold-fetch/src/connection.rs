//! Per-slot connection bookkeeping.
//!
//! A connection slot tracks exactly one in-flight request: the next
//! request id only advances past the next response id when a request is
//! outstanding, and no new request may be issued until they are equal
//! again. Budget accounting mirrors the peer's receive window so the
//! pool never writes a frame the peer cannot take.

use bytes::BytesMut;
use manifold_core::{ConnectionId, CorrelationId, NodeId};

use crate::wire::KafkaRequest;

/// What a connection slot is used for.
///
/// Live and historical fetches to the same broker use separate slots so
/// a long historical replay cannot starve live tail delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Fetches at the live tail.
    Live,
    /// Fetches catching up through history.
    Historical,
    /// Metadata, configs, and bootstrap traffic.
    Metadata,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Historical => write!(f, "historical"),
            Self::Metadata => write!(f, "metadata"),
        }
    }
}

/// Lifecycle of a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport attempt underway.
    Disconnected,
    /// Transport attempt started, not yet confirmed.
    Connecting,
    /// Connected and idle.
    Ready,
    /// Connected with one request outstanding.
    AwaitingResponse,
}

/// The request a slot is waiting on.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Correlation id the response must echo.
    pub correlation: CorrelationId,
    /// The decoded request, kept so the response decoder knows its shape.
    pub request: KafkaRequest,
}

/// One broker connection slot.
#[derive(Debug)]
pub struct Connection {
    /// Slot id, stable across reconnects.
    pub id: ConnectionId,
    /// What the slot carries.
    pub kind: ConnectionKind,
    /// Broker the slot is bound to.
    pub node: NodeId,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Id the next request will take.
    pub next_request_id: u64,
    /// Id the next response must answer.
    pub next_response_id: u64,
    /// Bytes the peer will currently accept.
    pub request_budget: u32,
    /// Per-frame overhead the peer charges on top of payload bytes.
    pub request_padding: u32,
    /// Unconsumed response bytes.
    pub recv: BytesMut,
    /// When the outstanding response is considered overdue.
    pub idle_deadline_us: Option<u64>,
    /// The outstanding request, if any.
    pub in_flight: Option<PendingRequest>,
    /// Consecutive connection failures.
    pub retries: u32,
    /// When the next reconnect attempt is due.
    pub retry_at_us: Option<u64>,
}

impl Connection {
    /// Creates a disconnected slot bound to a broker.
    #[must_use]
    pub fn new(id: ConnectionId, kind: ConnectionKind, node: NodeId) -> Self {
        Self {
            id,
            kind,
            node,
            state: ConnectionState::Disconnected,
            next_request_id: 0,
            next_response_id: 0,
            request_budget: 0,
            request_padding: 0,
            recv: BytesMut::new(),
            idle_deadline_us: None,
            in_flight: None,
            retries: 0,
            retry_at_us: None,
        }
    }

    /// Returns true when a new request may be issued.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.state == ConnectionState::Ready
            && self.next_request_id == self.next_response_id
            && self.request_budget > self.request_padding
    }

    /// Bytes available for a request payload right now.
    #[must_use]
    pub const fn writable_request_bytes(&self) -> u32 {
        self.request_budget.saturating_sub(self.request_padding)
    }

    /// Claims the next correlation id and marks the request in flight.
    ///
    /// # Panics
    /// Panics if a request is already outstanding.
    pub fn begin_request(&mut self, request: KafkaRequest) -> CorrelationId {
        assert!(
            self.next_request_id == self.next_response_id,
            "request already in flight"
        );
        let correlation = CorrelationId::new(self.next_request_id);
        self.next_request_id += 1;
        self.in_flight = Some(PendingRequest {
            correlation,
            request,
        });
        self.state = ConnectionState::AwaitingResponse;
        correlation
    }

    /// Charges the peer's window for a written frame.
    pub fn charge(&mut self, frame_bytes: u32) {
        let total = frame_bytes.saturating_add(self.request_padding);
        self.request_budget = self.request_budget.saturating_sub(total);
    }

    /// Applies a window grant from the peer.
    pub fn grant_window(&mut self, credit: u32, padding: u32) {
        self.request_budget = self.request_budget.saturating_add(credit);
        self.request_padding = padding;
    }

    /// Completes the outstanding request and returns it.
    #[must_use]
    pub fn complete_response(&mut self) -> Option<PendingRequest> {
        let pending = self.in_flight.take()?;
        self.next_response_id += 1;
        self.state = ConnectionState::Ready;
        Some(pending)
    }

    /// Resets the slot to a blank disconnected state.
    ///
    /// Retry bookkeeping is kept by the caller; everything tied to the
    /// dead transport is discarded.
    pub fn reinitialize(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.next_request_id = 0;
        self.next_response_id = 0;
        self.request_budget = 0;
        self.request_padding = 0;
        self.recv.clear();
        self.idle_deadline_us = None;
        self.in_flight = None;
    }

    /// Arms the read-idle timer.
    pub fn arm_idle(&mut self, now_us: u64, timeout_us: u64) {
        self.idle_deadline_us = Some(now_us.saturating_add(timeout_us));
    }

    /// Disarms the read-idle timer.
    pub fn clear_idle(&mut self) {
        self.idle_deadline_us = None;
    }

    /// Returns true when the outstanding response is overdue.
    #[must_use]
    pub fn idle_expired(&self, now_us: u64) -> bool {
        self.idle_deadline_us.is_some_and(|deadline| now_us >= deadline)
    }
}
