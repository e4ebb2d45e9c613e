//! The durable command log.
//!
//! Appends land in an in-memory buffer that the before-sleep hook flushes
//! to the stable backing store. A failed flush keeps the buffer, marks the
//! sticky failure status the admission gates consult, and is retried by
//! the cron; the status clears itself on the next successful flush. Byte
//! accounting against the last rewrite base drives the automatic
//! log-rewrite trigger.

use ember_common::ids::DbIndex;
use ember_core::command::CommandFrame;
use ember_core::propagation::DurableLogWriter;
use ember_core::state::PersistStatus;

/// One durable-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Target keyspace.
    pub db: DbIndex,
    /// Command-equivalent payload.
    pub frame: CommandFrame,
}

impl LogRecord {
    fn byte_len(&self) -> u64 {
        self.frame.payload_len() as u64 + 8
    }
}

/// In-memory durable command log.
#[derive(Debug, Clone, Default)]
pub struct DurableLog {
    enabled: bool,
    buffer: Vec<LogRecord>,
    stable: Vec<LogRecord>,
    stable_bytes: u64,
    base_bytes: u64,
    last_write_status: Option<PersistStatus>,
    flush_postponed: bool,
    sync_in_progress: bool,
    force_write_errors: bool,
}

impl DurableLog {
    /// Creates a log in the given enablement state.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    /// Outcome of the latest flush attempt. `Ok` before any flush ran.
    #[must_use]
    pub fn last_write_status(&self) -> PersistStatus {
        self.last_write_status.unwrap_or(PersistStatus::Ok)
    }

    /// Whether a flush was postponed behind a slow sync.
    #[must_use]
    pub fn flush_postponed(&self) -> bool {
        self.flush_postponed
    }

    /// Marks a backing-store sync as in progress; flushes are postponed
    /// until it clears.
    pub fn set_sync_in_progress(&mut self, busy: bool) {
        self.sync_in_progress = busy;
    }

    /// Makes subsequent flushes fail, modelling a broken backing store.
    pub fn force_write_errors(&mut self, failing: bool) {
        self.force_write_errors = failing;
    }

    /// Stable plus buffered size in bytes.
    #[must_use]
    pub fn current_bytes(&self) -> u64 {
        self.stable_bytes
            + self
                .buffer
                .iter()
                .map(LogRecord::byte_len)
                .sum::<u64>()
    }

    /// Size recorded by the latest completed rewrite.
    #[must_use]
    pub fn base_bytes(&self) -> u64 {
        self.base_bytes
    }

    /// Growth percentage over the rewrite base.
    #[must_use]
    pub fn growth_pct(&self) -> u64 {
        let base = self.base_bytes.max(1);
        (self.current_bytes() * 100 / base).saturating_sub(100)
    }

    /// Records currently in the stable backing store.
    #[must_use]
    pub fn stable_records(&self) -> &[LogRecord] {
        &self.stable
    }

    /// Number of records not yet flushed.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Installs the compacted record set produced by a finished rewrite
    /// and resets the growth base.
    pub fn complete_rewrite(&mut self, compacted: Vec<LogRecord>) {
        self.stable_bytes = compacted.iter().map(LogRecord::byte_len).sum();
        self.stable = compacted;
        self.base_bytes = self.stable_bytes.max(1);
        tracing::info!(bytes = self.stable_bytes, "log rewrite installed");
    }
}

impl DurableLogWriter for DurableLog {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn append(&mut self, db: DbIndex, frame: &CommandFrame) {
        if !self.enabled {
            return;
        }
        self.buffer.push(LogRecord {
            db,
            frame: frame.clone(),
        });
    }

    fn flush(&mut self) {
        if !self.enabled {
            return;
        }
        if self.buffer.is_empty() && self.last_write_status() == PersistStatus::Ok {
            return;
        }
        if self.sync_in_progress {
            self.flush_postponed = true;
            return;
        }
        if self.force_write_errors {
            if self.last_write_status() != PersistStatus::Failed {
                tracing::warn!("durable log flush failed, write status degraded");
            }
            self.last_write_status = Some(PersistStatus::Failed);
            return;
        }

        self.stable_bytes += self
            .buffer
            .iter()
            .map(LogRecord::byte_len)
            .sum::<u64>();
        self.stable.append(&mut self.buffer);
        if self.last_write_status() == PersistStatus::Failed {
            tracing::info!("durable log flush recovered, write status restored");
        }
        self.last_write_status = Some(PersistStatus::Ok);
        self.flush_postponed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::DurableLog;
    use ember_core::command::CommandFrame;
    use ember_core::propagation::DurableLogWriter;
    use ember_core::state::PersistStatus;
    use googletest::prelude::*;
    use rstest::rstest;

    fn record() -> CommandFrame {
        CommandFrame::new("SET", vec![b"k".to_vec(), b"v".to_vec()])
    }

    #[rstest]
    fn disabled_log_drops_appends() {
        let mut log = DurableLog::new(false);
        log.append(0, &record());
        log.flush();
        assert_that!(log.stable_records().is_empty(), eq(true));
        assert_that!(log.buffered_len(), eq(0_usize));
    }

    #[rstest]
    fn flush_moves_buffered_records_to_stable_storage() {
        let mut log = DurableLog::new(true);
        log.append(0, &record());
        log.append(1, &record());
        assert_that!(log.buffered_len(), eq(2_usize));

        log.flush();
        assert_that!(log.buffered_len(), eq(0_usize));
        assert_that!(log.stable_records().len(), eq(2_usize));
        assert_that!(log.stable_records()[1].db, eq(1_u16));
    }

    #[rstest]
    fn failed_flush_is_sticky_until_a_write_succeeds() {
        let mut log = DurableLog::new(true);
        log.force_write_errors(true);
        log.append(0, &record());
        log.flush();
        assert_that!(log.last_write_status(), eq(PersistStatus::Failed));
        // The record was not lost.
        assert_that!(log.buffered_len(), eq(1_usize));

        log.flush();
        assert_that!(log.last_write_status(), eq(PersistStatus::Failed));

        log.force_write_errors(false);
        log.flush();
        assert_that!(log.last_write_status(), eq(PersistStatus::Ok));
        assert_that!(log.stable_records().len(), eq(1_usize));
    }

    #[rstest]
    fn slow_sync_postpones_the_flush() {
        let mut log = DurableLog::new(true);
        log.set_sync_in_progress(true);
        log.append(0, &record());
        log.flush();
        assert_that!(log.flush_postponed(), eq(true));
        assert_that!(log.buffered_len(), eq(1_usize));

        log.set_sync_in_progress(false);
        log.flush();
        assert_that!(log.flush_postponed(), eq(false));
        assert_that!(log.buffered_len(), eq(0_usize));
    }

    #[rstest]
    fn rewrite_resets_the_growth_base() {
        let mut log = DurableLog::new(true);
        for _ in 0..10 {
            log.append(0, &record());
        }
        log.flush();
        let grown = log.growth_pct();
        assert_that!(grown > 0, eq(true));

        log.complete_rewrite(vec![super::LogRecord {
            db: 0,
            frame: record(),
        }]);
        assert_that!(log.growth_pct(), eq(0_u64));
        assert_that!(log.stable_records().len(), eq(1_usize));
    }
}
