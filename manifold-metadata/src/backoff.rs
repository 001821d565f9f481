//! Exponential retry backoff.

/// Computes retry delays that double per attempt up to a fixed maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min_ms: u64,
    max_ms: u64,
}

impl Backoff {
    /// Creates a backoff with the given bounds in milliseconds.
    ///
    /// # Panics
    /// Panics if `min_ms` is zero or greater than `max_ms`.
    #[must_use]
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        assert!(min_ms > 0, "backoff minimum must be positive");
        assert!(min_ms <= max_ms, "backoff minimum must not exceed maximum");
        Self { min_ms, max_ms }
    }

    /// Delay in milliseconds before retry number `retries`.
    ///
    /// Non-decreasing in `retries` and never exceeds the maximum.
    #[must_use]
    pub const fn next(&self, retries: u32) -> u64 {
        // Saturate the shift so large retry counts stay at the cap.
        let delay = if retries >= 63 {
            u64::MAX
        } else {
            self.min_ms.saturating_mul(1 << retries)
        };
        if delay > self.max_ms {
            self.max_ms
        } else {
            delay
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(10, 10_000)
    }
}
