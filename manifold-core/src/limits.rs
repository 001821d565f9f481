//! System limits and configuration bounds.
//!
//! Following `TigerStyle`: put limits on everything.
//! Every buffer, request, and timer has an explicit maximum, which keeps
//! the fetch pool's resource usage predictable under load.

/// System-wide limits for Manifold.
///
/// All limits are explicit and configurable. Default values are chosen
/// to be safe for most deployments while allowing customization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Fetch request shaping.
    /// Maximum total bytes a single fetch response may carry.
    pub fetch_max_bytes: u32,
    /// Maximum bytes fetched for one partition in one request.
    pub fetch_partition_max_bytes: u32,
    /// How long the broker may hold a fetch waiting for data, in milliseconds.
    pub fetch_max_wait_ms: u32,
    /// Minimum bytes the broker should accumulate before responding.
    pub fetch_min_bytes: u32,

    // Network limits.
    /// Maximum size of one response frame in bytes.
    pub max_frame_bytes: u32,
    /// Transport window advertised to a broker stream at connect.
    pub initial_response_budget: u32,
    /// Maximum number of physical connections across all kinds.
    pub max_connections: u32,

    // Timers (in microseconds unless noted).
    /// Abort a connection when no response bytes arrive for this long.
    pub read_idle_timeout_us: u64,
    /// Minimum retry backoff in milliseconds.
    pub backoff_min_ms: u64,
    /// Maximum retry backoff in milliseconds.
    pub backoff_max_ms: u64,

    // Reentrancy.
    /// Maximum nesting depth collapsed by the request-flush guard.
    pub max_nested_flush: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    ///
    /// The fetch sizes follow the broker-side defaults; production systems
    /// should tune these to their workload.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Fetch: 50MB response, 1MB per partition, 500ms wait.
            fetch_max_bytes: 50 * 1024 * 1024,
            fetch_partition_max_bytes: 1024 * 1024,
            fetch_max_wait_ms: 500,
            fetch_min_bytes: 1,

            // Network: 100MB frames, 16MB initial window, 64 connections.
            max_frame_bytes: 100 * 1024 * 1024,
            initial_response_budget: 16 * 1024 * 1024,
            max_connections: 64,

            // Timers: 30s idle, 10ms..10s backoff.
            read_idle_timeout_us: 30 * 1_000_000,
            backoff_min_ms: 10,
            backoff_max_ms: 10_000,

            max_nested_flush: 8,
        }
    }

    /// Creates small limits suitable for tests.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            fetch_max_bytes: 64 * 1024,
            fetch_partition_max_bytes: 16 * 1024,
            fetch_max_wait_ms: 10,
            fetch_min_bytes: 1,
            max_frame_bytes: 1024 * 1024,
            initial_response_budget: 64 * 1024,
            max_connections: 8,
            read_idle_timeout_us: 1_000_000,
            backoff_min_ms: 10,
            backoff_max_ms: 1_000,
            max_nested_flush: 8,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub fn validate(&self) -> crate::Result<()> {
        if self.fetch_max_bytes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "fetch_max_bytes",
                reason: "must be positive",
            });
        }

        if self.fetch_partition_max_bytes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "fetch_partition_max_bytes",
                reason: "must be positive",
            });
        }

        // A single partition's slice cannot exceed the whole response.
        if self.fetch_partition_max_bytes > self.fetch_max_bytes {
            return Err(crate::Error::InvalidArgument {
                name: "fetch_partition_max_bytes",
                reason: "must be <= fetch_max_bytes",
            });
        }

        if self.max_frame_bytes < self.fetch_max_bytes {
            return Err(crate::Error::InvalidArgument {
                name: "max_frame_bytes",
                reason: "must be >= fetch_max_bytes",
            });
        }

        if self.max_connections == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_connections",
                reason: "must be positive",
            });
        }

        if self.read_idle_timeout_us == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "read_idle_timeout_us",
                reason: "must be positive",
            });
        }

        if self.backoff_min_ms == 0 || self.backoff_max_ms < self.backoff_min_ms {
            return Err(crate::Error::InvalidArgument {
                name: "backoff_max_ms",
                reason: "must be >= backoff_min_ms > 0",
            });
        }

        if self.max_nested_flush == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_nested_flush",
                reason: "must be positive",
            });
        }

        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}
