//! Background snapshot and log-rewrite tasks.
//!
//! Instead of a forked child sharing pages copy-on-write, each task gets
//! an isolated clone of the store and runs on its own thread; the live
//! dataset is never touched from outside the dispatch thread. Completion
//! travels back over a narrow channel carrying a success flag, byte
//! counts and (for rewrites) the compacted record set, which the cron
//! reaps without ever blocking.

use std::sync::mpsc;
use std::thread;

use ember_common::ids::{DbIndex, UnixMillis};
use ember_core::command::CommandFrame;
use ember_core::keyspace::MemoryStore;

/// What kind of work a child performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// Full-dataset snapshot serialization.
    Snapshot,
    /// Durable-log compaction.
    LogRewrite,
}

/// Completion report delivered over the child's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildReport {
    /// Work kind.
    pub kind: ChildKind,
    /// Whether the work finished successfully.
    pub ok: bool,
    /// Serialized byte volume.
    pub bytes: u64,
    /// Compacted records, present for successful rewrites.
    pub compacted: Vec<(DbIndex, CommandFrame)>,
}

/// One in-flight background task.
#[derive(Debug)]
struct ChildTask {
    kind: ChildKind,
    handle: Option<thread::JoinHandle<()>>,
    report: mpsc::Receiver<ChildReport>,
    /// Dirty-counter value captured when the task started; installed as
    /// the snapshot baseline on success.
    dirty_at_start: u64,
    started_at: UnixMillis,
}

/// Owner of the single background child slot.
///
/// At most one snapshot or rewrite runs at a time, mirroring the rule
/// that dataset-maintenance work is skipped while a child is writing.
#[derive(Debug, Default)]
pub struct ChildSupervisor {
    active: Option<ChildTask>,
    /// A rewrite was requested while the slot was busy; the cron starts it
    /// once the slot frees up.
    pub log_rewrite_scheduled: bool,
    /// Fault injection for the next spawned task.
    pub fail_next: bool,
}

impl ChildSupervisor {
    /// Creates an idle supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a child is currently running (or awaiting reaping).
    #[must_use]
    pub fn has_active_child(&self) -> bool {
        self.active.is_some()
    }

    /// Kind of the in-flight child, if any.
    #[must_use]
    pub fn active_kind(&self) -> Option<ChildKind> {
        self.active.as_ref().map(|task| task.kind)
    }

    /// Dirty baseline captured when the in-flight child started.
    #[must_use]
    pub fn active_dirty_baseline(&self) -> Option<u64> {
        self.active.as_ref().map(|task| task.dirty_at_start)
    }

    /// Start time of the in-flight child, if any.
    #[must_use]
    pub fn active_since(&self) -> Option<UnixMillis> {
        self.active.as_ref().map(|task| task.started_at)
    }

    /// Starts a background task over an isolated store clone. Returns
    /// `false` when the slot is already occupied.
    pub fn start(
        &mut self,
        kind: ChildKind,
        clone: MemoryStore,
        dirty_at_start: u64,
        now: UnixMillis,
    ) -> bool {
        if self.active.is_some() {
            return false;
        }

        let (report_tx, report_rx) = mpsc::channel();
        let fail = self.fail_next;
        self.fail_next = false;
        let handle = thread::spawn(move || {
            let records = clone.export_records();
            let bytes = records
                .iter()
                .map(|(_, frame)| frame.payload_len() as u64 + 8)
                .sum();
            let report = if fail {
                ChildReport {
                    kind,
                    ok: false,
                    bytes: 0,
                    compacted: Vec::new(),
                }
            } else {
                ChildReport {
                    kind,
                    ok: true,
                    bytes,
                    compacted: if kind == ChildKind::LogRewrite {
                        records
                    } else {
                        Vec::new()
                    },
                }
            };
            let _ = report_tx.send(report);
        });

        self.active = Some(ChildTask {
            kind,
            handle: Some(handle),
            report: report_rx,
            dirty_at_start,
            started_at: now,
        });
        tracing::info!(?kind, started_at = now, "background child started");
        true
    }

    /// Non-blocking reap: returns the report once the child finished.
    /// A child that died without reporting is treated as a failure.
    pub fn try_reap(&mut self) -> Option<ChildReport> {
        let finished = {
            let task = self.active.as_ref()?;
            match task.report.try_recv() {
                Ok(report) => Some(report),
                Err(mpsc::TryRecvError::Empty) => None,
                Err(mpsc::TryRecvError::Disconnected) => Some(ChildReport {
                    kind: task.kind,
                    ok: false,
                    bytes: 0,
                    compacted: Vec::new(),
                }),
            }
        }?;

        if let Some(mut task) = self.active.take() {
            if let Some(handle) = task.handle.take() {
                let _ = handle.join();
            }
        }
        Some(finished)
    }

    /// Abandons the in-flight child, used on shutdown.
    pub fn terminate_active(&mut self) {
        if let Some(mut task) = self.active.take() {
            tracing::warn!(kind = ?task.kind, "terminating in-flight background child");
            if let Some(handle) = task.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
