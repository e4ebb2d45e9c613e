//! Propagation primitives: targets, ops and the sink contracts.
//!
//! A propagation decision is a [`PropTarget`] mask computed once per
//! top-level call from the dirty delta and the session's force/prevent
//! flags. Commands that need to record side effects distinct from their
//! own invocation accumulate [`Op`]s in the per-call buffer; the
//! dispatcher flushes them after the main decision, wrapping multiple ops
//! in an atomic envelope.

use ember_common::ids::DbIndex;

use crate::command::CommandFrame;

/// Destination mask for one propagated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PropTarget(u8);

impl PropTarget {
    /// No destination; the record is dropped.
    pub const NONE: Self = Self(0);
    /// The durable command log.
    pub const LOG: Self = Self(1);
    /// All attached replica streams.
    pub const REPL: Self = Self(2);
    /// Both destinations.
    pub const ALL: Self = Self(3);

    /// Returns whether every destination in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Adds the destinations in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Removes the destinations in `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Returns the union of both masks.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether no destination is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// One decided side effect awaiting the post-call flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    /// Target keyspace.
    pub db: DbIndex,
    /// Command-equivalent record. Never mutated after creation.
    pub frame: CommandFrame,
    /// Destination mask, still subject to the call-level target filter.
    pub target: PropTarget,
}

/// Per-call accumulation state.
#[derive(Debug, Clone, Default)]
pub struct PropagationBuffer {
    /// Replacement record for the main command, set when a
    /// non-deterministic invocation rewrites itself into a deterministic
    /// equivalent before being recorded.
    pub rewritten: Option<CommandFrame>,
    ops: Vec<Op>,
}

impl PropagationBuffer {
    /// Appends one extra op.
    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    /// Number of accumulated extra ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no extra op was accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Hands the accumulated ops to the flush.
    #[must_use]
    pub fn take_ops(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.ops)
    }
}

/// Durable command log consumed by the propagation engine.
///
/// Append failures never surface here; the implementation records them in
/// a sticky status flag the admission checks read.
pub trait DurableLogWriter {
    /// Whether the log is accepting records at all.
    fn enabled(&self) -> bool;

    /// Appends one record to the in-memory log buffer.
    fn append(&mut self, db: DbIndex, frame: &CommandFrame);

    /// Moves buffered records to the backing store.
    fn flush(&mut self);
}

/// Fan-out to every attached replica stream.
pub trait ReplicaBroadcaster {
    /// Sends one record down every replica stream.
    fn feed(&mut self, db: DbIndex, frame: &CommandFrame);

    /// Current primary stream offset.
    fn current_offset(&self) -> u64;

    /// Number of replicas that acknowledged at least `offset`.
    fn acked_replicas(&self, offset: u64) -> usize;
}

/// Hands one record to the destinations in `target`.
pub fn propagate(
    log: &mut dyn DurableLogWriter,
    feed: &mut dyn ReplicaBroadcaster,
    db: DbIndex,
    frame: &CommandFrame,
    target: PropTarget,
) {
    if target.contains(PropTarget::LOG) && log.enabled() {
        log.append(db, frame);
    }
    if target.contains(PropTarget::REPL) {
        feed.feed(db, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::PropTarget;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn target_mask_set_operations() {
        let mut target = PropTarget::NONE;
        assert_that!(target.is_empty(), eq(true));

        target.insert(PropTarget::REPL);
        assert_that!(target.contains(PropTarget::REPL), eq(true));
        assert_that!(target.contains(PropTarget::ALL), eq(false));

        target.insert(PropTarget::LOG);
        assert_that!(target, eq(PropTarget::ALL));

        target.remove(PropTarget::LOG);
        assert_that!(target, eq(PropTarget::REPL));
    }
}
