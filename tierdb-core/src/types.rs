//! # Core Data Types
//!
//! Identifiers and timestamps shared across crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Worker thread (context) identifier
pub type ThreadId = u16;

/// Index of a commit slot inside one thread's slot table
pub type SlotIndex = u16;

/// Reuse counter of a commit slot
pub type Generation = u64;

/// NUMA / CXL memory node
pub type NodeId = usize;

/// Logical transaction timestamp.
///
/// Timestamps are handed out by a single monotonic clock, so two transactions never
/// share one. `Timestamp::ZERO` predates every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Timestamp(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(raw: u64) -> Self {
        Timestamp(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp::ZERO < Timestamp::new(1));
        assert!(Timestamp::new(41) < Timestamp::new(42));
        assert_eq!(Timestamp::from(7).get(), 7);
        assert_eq!(Timestamp::new(3).to_string(), "ts3");
    }
}
