//! Canonical identifier types used across the execution core.

/// Logical keyspace index (`SELECT` compatible model).
pub type DbIndex = u16;

/// Hash slot identifier used by cluster routing.
pub type SlotId = u16;

/// Upper bound of the hash slot space (16384 slots).
pub const MAX_SLOT_ID: SlotId = 0x3FFF;

/// Stable per-process client connection identifier.
pub type ClientId = u64;

/// Milliseconds since the unix epoch, as cached by the server clock.
pub type UnixMillis = u64;

/// Validated keyspace-count wrapper so runtime APIs never receive zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DbCount(u16);

impl DbCount {
    /// Creates a validated keyspace count.
    ///
    /// Returns `None` for zero since the server always hosts at least one
    /// keyspace.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::DbCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn db_count_rejects_zero() {
        assert_that!(DbCount::new(0), eq(None));
    }

    #[rstest]
    #[case(1)]
    #[case(16)]
    #[case(u16::MAX)]
    fn db_count_accepts_positive_values(#[case] input: u16) {
        let count = DbCount::new(input).expect("positive count must be valid");
        assert_that!(count.get(), eq(input));
    }
}
