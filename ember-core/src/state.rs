//! Server-wide execution state.
//!
//! Everything the admission gates, the dispatcher and the cron share lives
//! in this one explicitly-owned struct: the cached clock, the dirty
//! counter, persistence and replication health flags, throughput metrics,
//! the slow-command log and the blocked-client bookkeeping. The struct is
//! passed by mutable reference along the single dispatch thread; nothing
//! here is behind a lock because nothing else is allowed to touch it.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use ember_common::ids::{ClientId, DbIndex, UnixMillis};

use crate::command::CommandFrame;
use crate::containers::HotMap;
use crate::session::SESSION_CATEGORY_COUNT;

/// Outcome of the latest write attempt of a persistence sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStatus {
    /// Last write succeeded.
    Ok,
    /// Last write failed; sticky until a later write succeeds.
    Failed,
}

/// Replication role of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// This node owns the dataset and feeds replicas.
    Primary,
    /// This node applies the primary's stream.
    Replica,
}

/// Health of the upstream link when this node is a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Stream from the primary is flowing.
    Connected,
    /// Stream from the primary is interrupted.
    Broken,
}

/// Clean-shutdown variant requested by `SHUTDOWN` or a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// Persist a final snapshot when save points are configured.
    Default,
    /// Always persist a final snapshot.
    Save,
    /// Never persist on the way out.
    NoSave,
}

/// Rolling-window throughput metric indices.
pub const METRIC_COMMANDS: usize = 0;
/// Ingress bytes metric.
pub const METRIC_NET_INPUT: usize = 1;
/// Egress bytes metric.
pub const METRIC_NET_OUTPUT: usize = 2;
/// Number of tracked metrics.
pub const METRIC_COUNT: usize = 3;

const METRIC_SAMPLES: usize = 16;

/// Slots in the per-second peak-memory ring kept by the connection
/// maintenance pass.
pub const PEAK_MEMORY_SLOTS: usize = 8;

/// One rolling throughput window: per-sample rates computed from the delta
/// against the previous reading.
#[derive(Debug, Clone, Copy)]
pub struct RollingMetric {
    last_sample_at: UnixMillis,
    last_reading: u64,
    samples: [u64; METRIC_SAMPLES],
    index: usize,
}

impl RollingMetric {
    fn new() -> Self {
        Self {
            last_sample_at: 0,
            last_reading: 0,
            samples: [0; METRIC_SAMPLES],
            index: 0,
        }
    }

    fn record(&mut self, now: UnixMillis, reading: u64) {
        let elapsed = now.saturating_sub(self.last_sample_at);
        let delta = reading.saturating_sub(self.last_reading);
        let per_second = if elapsed > 0 { delta * 1000 / elapsed } else { 0 };
        self.samples[self.index] = per_second;
        self.index = (self.index + 1) % METRIC_SAMPLES;
        self.last_sample_at = now;
        self.last_reading = reading;
    }

    fn mean(&self) -> u64 {
        self.samples.iter().sum::<u64>() / METRIC_SAMPLES as u64
    }
}

/// One slow-command sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowlogEntry {
    /// Monotonically increasing sample id.
    pub id: u64,
    /// Cached clock value when the command finished.
    pub at: UnixMillis,
    /// Execution time in microseconds.
    pub duration_micros: u64,
    /// Command name.
    pub command: String,
    /// Argument payload, as invoked.
    pub args: Vec<Vec<u8>>,
}

/// Cumulative per-command introspection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStats {
    /// Number of completed invocations.
    pub calls: u64,
    /// Accumulated execution time in microseconds.
    pub total_micros: u64,
}

/// The shared execution-state object.
#[derive(Debug, Clone)]
pub struct ServerState {
    /// Cached wall-clock milliseconds, refreshed by cron and at the first
    /// nesting level of every call.
    pub unix_ms: UnixMillis,
    /// Logical aging clock consumed by eviction-candidate scoring.
    pub lru_clock: u32,
    /// Nesting depth of in-flight calls sharing one cached clock value.
    pub fixed_time_expire: u32,
    /// Count of dataset mutations since startup.
    pub dirty: u64,
    /// Mutation count captured by the latest successful snapshot.
    pub dirty_at_last_snapshot: u64,
    /// Whether a bulk dataset load is in progress.
    pub loading: bool,
    /// Whether a server-side script exceeded its time budget.
    pub script_timedout: bool,
    /// Pending clean-shutdown request.
    pub shutdown_requested: Option<ShutdownKind>,
    /// Replication role.
    pub role: NodeRole,
    /// Upstream link health (meaningful on replicas).
    pub link: LinkState,
    /// Replicas currently within the acceptable acknowledgement lag.
    pub good_replicas: usize,
    /// Sticky status of the durable command log.
    pub log_status: PersistStatus,
    /// Sticky status of the background snapshot writer.
    pub snapshot_status: PersistStatus,
    /// Cached clock value of the latest successful snapshot.
    pub last_snapshot_at: UnixMillis,
    /// Cached clock value of the latest snapshot attempt.
    pub last_snapshot_try_at: UnixMillis,
    /// Current adaptive cron frequency.
    pub hz: u32,
    /// Completed cron iterations.
    pub cronloops: u64,
    /// Total commands executed.
    pub stat_commands: u64,
    /// Total ingress bytes observed.
    pub stat_net_input_bytes: u64,
    /// Total egress bytes observed.
    pub stat_net_output_bytes: u64,
    /// Keys removed by the expiration machinery.
    pub stat_expired_keys: u64,
    /// Keys removed by the eviction machinery.
    pub stat_evicted_keys: u64,
    /// Largest memory-use figure observed.
    pub stat_peak_memory: u64,
    /// Rolling throughput windows.
    metrics: [RollingMetric; METRIC_COUNT],
    /// Per-command cumulative statistics, keyed by canonical name.
    pub command_stats: HotMap<&'static str, CommandStats>,
    /// Bounded slow-command log, newest first.
    pub slowlog: VecDeque<SlowlogEntry>,
    slowlog_next_id: u64,
    /// Keys made ready by the current call, pending blocked-client service.
    pub ready_keys: Vec<(DbIndex, Vec<u8>)>,
    /// Blocked sessions indexed by awaited key.
    pub blocked_on_keys: HotMap<(DbIndex, Vec<u8>), Vec<ClientId>>,
    /// Whether a replication ack round-trip should be requested before the
    /// next sleep.
    pub get_ack_from_replicas: bool,
    /// Per-second peak ingress buffer sizes.
    pub peak_input_memory: [usize; PEAK_MEMORY_SLOTS],
    /// Per-second peak egress buffer sizes.
    pub peak_output_memory: [usize; PEAK_MEMORY_SLOTS],
    /// Aggregated session memory by accounting bucket.
    pub session_memory_by_category: [usize; SESSION_CATEGORY_COUNT],
    /// Access-control denial audit trail.
    pub acl_audit: Vec<AclAuditEntry>,
}

/// One access-control denial, retained for operator inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclAuditEntry {
    /// Identity that was denied.
    pub user: String,
    /// Command the identity attempted.
    pub command: String,
    /// Whether the denial was about a key argument rather than the
    /// command itself.
    pub key_denied: bool,
    /// Cached clock value at denial time.
    pub at: UnixMillis,
}

impl ServerState {
    /// Creates the startup state for a primary node.
    #[must_use]
    pub fn new(hz: u32) -> Self {
        let unix_ms = wall_clock_ms();
        Self {
            unix_ms,
            lru_clock: (unix_ms / 1000) as u32,
            fixed_time_expire: 0,
            dirty: 0,
            dirty_at_last_snapshot: 0,
            loading: false,
            script_timedout: false,
            shutdown_requested: None,
            role: NodeRole::Primary,
            link: LinkState::Connected,
            good_replicas: 0,
            log_status: PersistStatus::Ok,
            snapshot_status: PersistStatus::Ok,
            last_snapshot_at: unix_ms,
            last_snapshot_try_at: 0,
            hz: hz.max(1),
            cronloops: 0,
            stat_commands: 0,
            stat_net_input_bytes: 0,
            stat_net_output_bytes: 0,
            stat_expired_keys: 0,
            stat_evicted_keys: 0,
            stat_peak_memory: 0,
            metrics: [RollingMetric::new(); METRIC_COUNT],
            command_stats: HotMap::new(),
            slowlog: VecDeque::new(),
            slowlog_next_id: 0,
            ready_keys: Vec::new(),
            blocked_on_keys: HotMap::new(),
            get_ack_from_replicas: false,
            peak_input_memory: [0; PEAK_MEMORY_SLOTS],
            peak_output_memory: [0; PEAK_MEMORY_SLOTS],
            session_memory_by_category: [0; SESSION_CATEGORY_COUNT],
            acl_audit: Vec::new(),
        }
    }

    /// Refreshes the cached wall clock and the derived aging clock.
    pub fn refresh_cached_time(&mut self) {
        self.unix_ms = wall_clock_ms();
        self.lru_clock = (self.unix_ms / 1000) as u32;
    }

    /// Overrides the cached clock, used by replay paths and tests that
    /// need deterministic time.
    pub fn set_clock(&mut self, unix_ms: UnixMillis) {
        self.unix_ms = unix_ms;
        self.lru_clock = (unix_ms / 1000) as u32;
    }

    /// Records one rolling-window sample for a metric.
    pub fn track_metric(&mut self, metric: usize, reading: u64) {
        let now = self.unix_ms;
        if let Some(window) = self.metrics.get_mut(metric) {
            window.record(now, reading);
        }
    }

    /// Mean per-second rate across the rolling window.
    #[must_use]
    pub fn metric_per_second(&self, metric: usize) -> u64 {
        self.metrics.get(metric).map_or(0, RollingMetric::mean)
    }

    /// Accumulates per-command call statistics.
    pub fn note_command_call(&mut self, name: &'static str, duration_micros: u64) {
        let entry = self.command_stats.entry(name).or_default();
        entry.calls += 1;
        entry.total_micros += duration_micros;
    }

    /// Appends a slow-command sample when the duration crosses the
    /// configured threshold.
    pub fn record_slowlog(
        &mut self,
        threshold_micros: Option<u64>,
        max_len: usize,
        frame: &CommandFrame,
        duration_micros: u64,
    ) {
        let Some(threshold) = threshold_micros else {
            return;
        };
        if duration_micros < threshold {
            return;
        }
        let entry = SlowlogEntry {
            id: self.slowlog_next_id,
            at: self.unix_ms,
            duration_micros,
            command: frame.name.clone(),
            args: frame.args.clone(),
        };
        self.slowlog_next_id += 1;
        self.slowlog.push_front(entry);
        self.slowlog.truncate(max_len);
    }

    /// Registers a session as blocked on the given keys.
    pub fn block_on_keys(&mut self, client: ClientId, keys: &[(DbIndex, Vec<u8>)]) {
        for (db, key) in keys {
            self.blocked_on_keys
                .entry((*db, key.clone()))
                .or_default()
                .push(client);
        }
    }

    /// Removes a session from every blocked-key wait list.
    pub fn unblock_from_keys(&mut self, client: ClientId) {
        self.blocked_on_keys.retain(|_, waiters| {
            waiters.retain(|waiting| *waiting != client);
            !waiters.is_empty()
        });
    }

    /// Notes that a key became ready for blocked waiters. Invoked by
    /// whichever command made the key ready; duplicates are collapsed.
    pub fn signal_key_ready(&mut self, db: DbIndex, key: &[u8]) {
        if !self.blocked_on_keys.contains_key(&(db, key.to_vec())) {
            return;
        }
        let pending = (db, key.to_vec());
        if !self.ready_keys.contains(&pending) {
            self.ready_keys.push(pending);
        }
    }

    /// Whether any session is waiting on the given key.
    #[must_use]
    pub fn has_waiters(&self, db: DbIndex, key: &[u8]) -> bool {
        self.blocked_on_keys.contains_key(&(db, key.to_vec()))
    }
}

fn wall_clock_ms() -> UnixMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as UnixMillis)
}

#[cfg(test)]
mod tests {
    use super::{ServerState, METRIC_COMMANDS};
    use crate::command::CommandFrame;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn rolling_metric_computes_per_second_rate_from_deltas() {
        let mut state = ServerState::new(10);
        state.set_clock(1_000);
        state.track_metric(METRIC_COMMANDS, 0);
        state.set_clock(2_000);
        state.track_metric(METRIC_COMMANDS, 500);

        // One 500-ops sample over one second, averaged over the window.
        assert_that!(state.metric_per_second(METRIC_COMMANDS), eq(500_u64 / 16));
    }

    #[rstest]
    fn slowlog_respects_threshold_and_bound() {
        let mut state = ServerState::new(10);
        let frame = CommandFrame::new("GET", vec![b"k".to_vec()]);

        state.record_slowlog(Some(1_000), 2, &frame, 500);
        assert_that!(state.slowlog.len(), eq(0_usize));

        for _ in 0..3 {
            state.record_slowlog(Some(1_000), 2, &frame, 5_000);
        }
        assert_that!(state.slowlog.len(), eq(2_usize));
        assert_that!(state.slowlog[0].id, eq(2_u64));
    }

    #[rstest]
    fn slowlog_disabled_when_threshold_absent() {
        let mut state = ServerState::new(10);
        let frame = CommandFrame::new("GET", vec![b"k".to_vec()]);
        state.record_slowlog(None, 8, &frame, u64::MAX);
        assert_that!(state.slowlog.is_empty(), eq(true));
    }

    #[rstest]
    fn ready_key_signal_requires_a_waiter_and_deduplicates() {
        let mut state = ServerState::new(10);
        state.signal_key_ready(0, b"q");
        assert_that!(state.ready_keys.is_empty(), eq(true));

        state.block_on_keys(7, &[(0, b"q".to_vec())]);
        state.signal_key_ready(0, b"q");
        state.signal_key_ready(0, b"q");
        assert_that!(state.ready_keys.len(), eq(1_usize));
    }

    #[rstest]
    fn unblock_removes_the_session_from_all_wait_lists() {
        let mut state = ServerState::new(10);
        state.block_on_keys(7, &[(0, b"a".to_vec()), (0, b"b".to_vec())]);
        state.block_on_keys(8, &[(0, b"a".to_vec())]);

        state.unblock_from_keys(7);
        assert_that!(state.has_waiters(0, b"b"), eq(false));
        assert_that!(state.has_waiters(0, b"a"), eq(true));
    }
}
