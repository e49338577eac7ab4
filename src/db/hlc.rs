//! Hybrid logical clock.
//!
//! Every transaction start and commit in the cluster is stamped with an
//! [`Hlc`]: a monotonic logical counter paired with an advisory wall-clock
//! reading. Only the logical component participates in ordering; the wall
//! clock exists for operators and cross-cluster diagnostics.
//!
//! [`HlcClock`] is a shard's local timestamp source. It hands out start
//! timestamps that are greater than every previously issued start or
//! observed commit timestamp, and it folds externally assigned commit
//! timestamps back in via [`HlcClock::observe`].

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::storage::delta::UNCOMMITTED_TAG;

/// A hybrid-logical-clock value.
#[derive(Debug, Clone, Copy)]
pub struct Hlc {
    /// Monotonic logical counter; the only component compared for ordering.
    pub logical: u64,
    /// Advisory wall-clock reading taken when the value was issued.
    pub wall_clock: DateTime<Utc>,
}

impl Hlc {
    /// Builds a value from both components.
    pub fn new(logical: u64, wall_clock: DateTime<Utc>) -> Self {
        Self {
            logical,
            wall_clock,
        }
    }

    /// Builds a value from a logical counter, stamping the current wall
    /// clock.
    pub fn from_logical(logical: u64) -> Self {
        Self {
            logical,
            wall_clock: Utc::now(),
        }
    }
}

impl PartialEq for Hlc {
    fn eq(&self, other: &Self) -> bool {
        self.logical == other.logical
    }
}

impl Eq for Hlc {}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.logical.cmp(&other.logical)
    }
}

/// A shard-local hybrid-logical-clock source.
///
/// Thread-safe; shared across accessors via the owning shard.
#[derive(Debug)]
pub struct HlcClock {
    logical: AtomicU64,
}

impl HlcClock {
    /// Creates a clock whose next tick is strictly greater than
    /// `start_logical`.
    pub fn new(start_logical: u64) -> Self {
        Self {
            logical: AtomicU64::new(start_logical),
        }
    }

    /// Issues the next timestamp. Guaranteed greater than every previously
    /// issued or observed timestamp on this clock.
    pub fn tick(&self) -> Hlc {
        let logical = self.logical.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(logical < UNCOMMITTED_TAG, "logical clock overflow");
        trace!(logical, "allocated timestamp");
        Hlc {
            logical,
            wall_clock: Utc::now(),
        }
    }

    /// Folds an externally assigned timestamp (a commit timestamp from the
    /// ordering collaborator, or a split version stamp) into the clock so
    /// later ticks stay ahead of it.
    pub fn observe(&self, hlc: Hlc) {
        self.logical.fetch_max(hlc.logical, Ordering::AcqRel);
    }

    /// The highest logical value issued or observed so far.
    pub fn current_logical(&self) -> u64 {
        self.logical.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_are_strictly_increasing() {
        let clock = HlcClock::new(0);
        let a = clock.tick();
        let b = clock.tick();
        let c = clock.tick();
        assert!(a < b && b < c);
        assert_eq!(a.logical, 1);
    }

    #[test]
    fn test_observe_advances_clock() {
        let clock = HlcClock::new(0);
        clock.observe(Hlc::from_logical(100));
        assert_eq!(clock.tick().logical, 101);
    }

    #[test]
    fn test_observe_never_rewinds() {
        let clock = HlcClock::new(50);
        clock.observe(Hlc::from_logical(10));
        assert_eq!(clock.tick().logical, 51);
    }

    #[test]
    fn test_ordering_ignores_wall_clock() {
        let a = Hlc::new(5, Utc::now());
        let b = Hlc::new(5, Utc::now() + chrono::Duration::hours(1));
        assert_eq!(a, b);
    }
}
