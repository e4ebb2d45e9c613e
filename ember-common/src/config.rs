//! Runtime configuration consumed by the execution core.
//!
//! There is intentionally no file or CLI parsing layer here: bootstrap code
//! builds a [`RuntimeConfig`] and hands it to the composition root. Every
//! field maps to one policy the admission gates, the dispatcher or the cron
//! consult at runtime.

use crate::ids::DbCount;

/// One snapshot save point: "at least `changes` mutations within `seconds`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavePoint {
    /// Window length in seconds.
    pub seconds: u64,
    /// Minimum number of dataset mutations inside the window.
    pub changes: u64,
}

/// Eviction strategy applied when the memory ceiling is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxmemoryPolicy {
    /// Never evict; memory-increasing commands are rejected instead.
    NoEviction,
    /// Evict sampled keys that carry an expiration deadline.
    VolatileRandom,
    /// Evict sampled keys from the whole keyspace.
    AllkeysRandom,
}

/// Process-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of independent keyspaces hosted by this process.
    pub databases: DbCount,
    /// Listener port for the RESP ingress.
    pub port: u16,
    /// Base cron frequency in ticks per second.
    pub config_hz: u32,
    /// Hard upper bound for the adaptive cron frequency.
    pub max_hz: u32,
    /// Whether the cron frequency scales with the connected-client count.
    pub dynamic_hz: bool,
    /// Client count one cron tick is expected to absorb before the
    /// frequency is doubled.
    pub clients_per_tick: usize,
    /// Memory ceiling in bytes. Zero disables the ceiling.
    pub maxmemory_bytes: u64,
    /// Eviction strategy used when the ceiling is exceeded.
    pub maxmemory_policy: MaxmemoryPolicy,
    /// Minimum replicas within acceptable lag required to accept writes.
    /// Zero disables the policy.
    pub min_replicas_to_write: usize,
    /// Maximum acknowledged-lag in seconds for a replica to count as good.
    pub min_replicas_max_lag_secs: u64,
    /// Whether a replica with a broken upstream link keeps serving reads.
    pub replica_serve_stale_data: bool,
    /// Whether this node, when acting as a replica, rejects writes from
    /// regular clients.
    pub replica_read_only: bool,
    /// Whether persistent-write failures suspend write acceptance.
    pub stop_writes_on_persist_error: bool,
    /// Whether the durable command log is enabled at startup.
    pub durable_log_enabled: bool,
    /// Background snapshot triggers checked by the cron.
    pub save_points: Vec<SavePoint>,
    /// Back-off before retrying a failed background snapshot, in seconds.
    pub snapshot_retry_secs: u64,
    /// Durable-log growth percentage over the last rewrite base that
    /// triggers an automatic rewrite. Zero disables the trigger.
    pub log_rewrite_growth_pct: u64,
    /// Minimum durable-log size before the growth trigger applies.
    pub log_rewrite_min_bytes: u64,
    /// Idle-client timeout in seconds. Zero disables the sweep.
    pub client_timeout_secs: u64,
    /// Query buffers above this size become shrink candidates when mostly
    /// empty or idle.
    pub query_buffer_shrink_bytes: usize,
    /// Slow-command threshold in microseconds. `None` disables the log.
    pub slowlog_threshold_micros: Option<u64>,
    /// Bounded length of the in-memory slow-command log.
    pub slowlog_max_len: usize,
    /// Whether cluster routing is active.
    pub cluster_enabled: bool,
    /// Whether primaries actively sample and remove expired keys.
    pub active_expire: bool,
    /// Operator-level command renames applied when the registry is built.
    /// An empty target disables the command in the live table.
    pub renamed_commands: Vec<(String, String)>,
    /// Number of byte-moving I/O worker threads. Zero keeps all encode
    /// work inline on the dispatch thread.
    pub io_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            databases: DbCount::new(16).expect("literal keyspace count must be non-zero"),
            port: 6379,
            config_hz: 10,
            max_hz: 500,
            dynamic_hz: true,
            clients_per_tick: 200,
            maxmemory_bytes: 0,
            maxmemory_policy: MaxmemoryPolicy::NoEviction,
            min_replicas_to_write: 0,
            min_replicas_max_lag_secs: 10,
            replica_serve_stale_data: true,
            replica_read_only: true,
            stop_writes_on_persist_error: true,
            durable_log_enabled: true,
            save_points: vec![
                SavePoint { seconds: 3600, changes: 1 },
                SavePoint { seconds: 300, changes: 100 },
                SavePoint { seconds: 60, changes: 10_000 },
            ],
            snapshot_retry_secs: 5,
            log_rewrite_growth_pct: 100,
            log_rewrite_min_bytes: 64 * 1024 * 1024,
            client_timeout_secs: 0,
            query_buffer_shrink_bytes: 32 * 1024,
            slowlog_threshold_micros: Some(10_000),
            slowlog_max_len: 128,
            cluster_enabled: false,
            active_expire: true,
            renamed_commands: Vec::new(),
            io_threads: 0,
        }
    }
}

impl RuntimeConfig {
    /// Tick period in milliseconds for a given frequency.
    #[must_use]
    pub fn tick_period_ms(hz: u32) -> u64 {
        1000 / u64::from(hz.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::RuntimeConfig;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn default_config_keeps_save_points_ordered_by_window() {
        let config = RuntimeConfig::default();
        assert_that!(config.save_points.len(), eq(3_usize));
        assert_that!(config.save_points[0].seconds > config.save_points[2].seconds, eq(true));
    }

    #[rstest]
    #[case(10, 100)]
    #[case(100, 10)]
    #[case(0, 1000)]
    fn tick_period_follows_frequency(#[case] hz: u32, #[case] expected_ms: u64) {
        assert_that!(RuntimeConfig::tick_period_ms(hz), eq(expected_ms));
    }
}
