//! Dispatch result flags.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Outcome flags from dispatching one record to one or more sinks.
///
/// Flags OR-combine across every sink a record reached: the coordinator
/// needs to know whether anyone matched, whether anyone actually took
/// delivery, and whether anyone stalled waiting for downstream window.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchFlags(u8);

impl DispatchFlags {
    /// No sink matched.
    pub const EMPTY: Self = Self(0);
    /// At least one sink's filter matched the record.
    pub const MATCHED: Self = Self(1);
    /// At least one sink accepted the record bytes.
    pub const DELIVERED: Self = Self(1 << 1);
    /// At least one matching sink is blocked on downstream window.
    ///
    /// Informational: the scheduler observes back pressure by polling
    /// each sink's `window_bytes`, not through this flag.
    pub const EXPECTING_WINDOW: Self = Self(1 << 2);

    /// Returns true if any sink matched.
    #[must_use]
    pub const fn matched(self) -> bool {
        self.0 & Self::MATCHED.0 != 0
    }

    /// Returns true if any sink took delivery.
    #[must_use]
    pub const fn delivered(self) -> bool {
        self.0 & Self::DELIVERED.0 != 0
    }

    /// Returns true if any sink is waiting for window.
    #[must_use]
    pub const fn expecting_window(self) -> bool {
        self.0 & Self::EXPECTING_WINDOW.0 != 0
    }

    /// Returns true if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DispatchFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DispatchFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for DispatchFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.matched() {
            parts.push("MATCHED");
        }
        if self.delivered() {
            parts.push("DELIVERED");
        }
        if self.expecting_window() {
            parts.push("EXPECTING_WINDOW");
        }
        if parts.is_empty() {
            parts.push("EMPTY");
        }
        write!(f, "DispatchFlags({})", parts.join("|"))
    }
}
