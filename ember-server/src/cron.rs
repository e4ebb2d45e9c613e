//! The fixed-frequency background maintenance tick.
//!
//! One `server_cron` call performs the whole maintenance round: clock and
//! metric refresh, adaptive frequency, shutdown handling, the
//! connection-maintenance pass, the dataset-maintenance pass (incremental
//! resize/rehash plus active expiration), persistence scheduling, child
//! reaping, replication and cluster housekeeping, and worker-pool sizing.
//! Sub-second work is spread across ticks with rotating cursors so no
//! single tick bursts.

use std::time::{Duration, Instant};

use ember_core::command::CommandFrame;
use ember_core::flags::SessionFlags;
use ember_core::keyspace::DataStore;
use ember_core::propagation::{propagate, DurableLogWriter, PropTarget};
use ember_core::state::{
    LinkState, NodeRole, PersistStatus, ShutdownKind, METRIC_COMMANDS, METRIC_NET_INPUT,
    METRIC_NET_OUTPUT, PEAK_MEMORY_SLOTS,
};
use ember_common::ids::ClientId;
use ember_replication::LogRecord;

use crate::app::ServerApp;
use crate::child::{ChildKind, ChildReport};

/// Keyspaces examined per maintenance tick.
const CRON_DBS_PER_TICK: u16 = 16;
/// Minimum connections visited per maintenance tick.
const CLIENTS_CRON_MIN_ITERATIONS: usize = 5;
/// Keys sampled per expiration loop.
const EXPIRE_LOOKUPS_PER_LOOP: usize = 20;
/// Observed stale percentage above which a cycle keeps sampling the same
/// keyspace instead of moving on.
const EXPIRE_STALE_PCT: usize = 25;
/// Share of one tick the slow expiration cycle may consume, in percent.
const EXPIRE_SLOW_BUDGET_PCT: u64 = 25;
/// Budget of the fast pre-sleep expiration pass.
const EXPIRE_FAST_BUDGET: Duration = Duration::from_micros(1_000);
/// Budget of one incremental rehash increment.
const REHASH_BUDGET: Duration = Duration::from_millis(1);

/// Cursors and counters surviving across ticks.
#[derive(Debug, Clone, Default)]
pub struct CronState {
    /// Next keyspace examined for a shrink trigger.
    pub resize_cursor: u32,
    /// Next keyspace examined for rehash work.
    pub rehash_cursor: u32,
    /// Next keyspace examined by active expiration.
    pub expire_db_cursor: u32,
    /// Rotating offset into the expiration index.
    pub expire_sample_offset: usize,
}

/// What the event loop should do after one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronAction {
    /// Keep serving.
    Continue,
    /// A clean shutdown completed; the process should exit.
    Shutdown,
}

fn run_with_period(app: &ServerApp, period_ms: u64) -> bool {
    let tick_ms = 1000 / u64::from(app.state.hz.max(1));
    period_ms <= tick_ms || app.state.cronloops % (period_ms / tick_ms.max(1)).max(1) == 0
}

/// One maintenance tick.
pub fn server_cron(app: &mut ServerApp) -> CronAction {
    if app.state.fixed_time_expire == 0 {
        app.state.refresh_cached_time();
    }

    // Adapt the tick frequency to the connected-client count so the
    // maintenance pass still visits every connection about once a second.
    app.state.hz = app.config.config_hz.max(1);
    if app.config.dynamic_hz {
        while app.rotation.len() / app.state.hz as usize > app.config.clients_per_tick {
            app.state.hz = (app.state.hz * 2).min(app.config.max_hz);
            if app.state.hz >= app.config.max_hz {
                break;
            }
        }
    }

    if run_with_period(app, 100) {
        let commands = app.state.stat_commands;
        let net_in = app.state.stat_net_input_bytes;
        let net_out = app.state.stat_net_output_bytes;
        app.state.track_metric(METRIC_COMMANDS, commands);
        app.state.track_metric(METRIC_NET_INPUT, net_in);
        app.state.track_metric(METRIC_NET_OUTPUT, net_out);
    }

    app.state.lru_clock = (app.state.unix_ms / 1000) as u32;
    let used = app.store.memory_used();
    if used > app.state.stat_peak_memory {
        app.state.stat_peak_memory = used;
    }

    if let Some(kind) = app.state.shutdown_requested {
        if prepare_shutdown(app, kind) {
            return CronAction::Shutdown;
        }
        tracing::warn!("errors while shutting down, resuming service");
        app.state.shutdown_requested = None;
    }

    if run_with_period(app, 5000) {
        for db in 0..app.config.databases.get() {
            let keys = app.store.key_count(db);
            let volatile = app.store.expires_count(db);
            if keys > 0 || volatile > 0 {
                tracing::debug!(
                    db,
                    keys,
                    volatile,
                    slots = app.store.table_capacity(db),
                    "keyspace summary"
                );
            }
        }
        tracing::debug!(
            clients = app.sessions.len(),
            replicas = app.feed.replica_count(),
            bytes = app.store.memory_used(),
            child = ?app.children.active_kind(),
            child_since = ?app.children.active_since(),
            "connection summary"
        );
    }

    clients_cron(app);
    databases_cron(app);

    // A rewrite deferred behind a busy child slot starts as soon as the
    // slot frees up.
    if !app.children.has_active_child() && app.children.log_rewrite_scheduled {
        app.children.log_rewrite_scheduled = false;
        start_log_rewrite(app);
    }

    if app.children.has_active_child() {
        let dirty_baseline = app.children.active_dirty_baseline().unwrap_or(app.state.dirty);
        if let Some(report) = app.children.try_reap() {
            handle_child_report(app, report, dirty_baseline);
        }
    } else {
        maybe_start_snapshot_from_save_points(app);
        maybe_start_growth_rewrite(app);
    }

    // Retry a postponed flush as soon as the slow sync cleared, and a
    // failed one every second so the write ban lifts promptly.
    if app.log.flush_postponed() {
        app.log.flush();
    }
    if run_with_period(app, 1000) && app.log.last_write_status() == PersistStatus::Failed {
        app.log.flush();
    }
    app.state.log_status = app.log.last_write_status();

    if run_with_period(app, 1000) {
        replication_cron(app);
    }
    if run_with_period(app, 1000) {
        let swept = app.migration_sockets.sweep(app.state.unix_ms);
        if swept > 0 {
            tracing::debug!(swept, "closed idle migration sockets");
        }
    }

    let backlog = app.pending_reply_volume();
    app.workers.adjust_for_load(backlog);

    app.state.cronloops += 1;
    CronAction::Continue
}

/// The connection-maintenance pass.
///
/// Visits at least `numclients / hz` connections per tick (minimum five)
/// by rotating the tail of the connection list to the head, so any
/// connection that must be removed is already the head.
pub(crate) fn clients_cron(app: &mut ServerApp) {
    let now = app.state.unix_ms;
    let numclients = app.rotation.len();
    let mut iterations = numclients / app.state.hz as usize;
    if iterations < CLIENTS_CRON_MIN_ITERATIONS {
        iterations = numclients.min(CLIENTS_CRON_MIN_ITERATIONS);
    }

    let slot = (now / 1000) as usize % PEAK_MEMORY_SLOTS;
    let ahead = (slot + 1) % PEAK_MEMORY_SLOTS;
    app.state.peak_input_memory[ahead] = 0;
    app.state.peak_output_memory[ahead] = 0;

    while iterations > 0 && !app.rotation.is_empty() {
        iterations -= 1;
        if let Some(tail) = app.rotation.pop_back() {
            app.rotation.push_front(tail);
        }
        let Some(&client) = app.rotation.front() else {
            break;
        };
        if !app.sessions.contains_key(&client) {
            let _ = app.rotation.pop_front();
            continue;
        }

        if clients_cron_handle_timeout(app, client, now) {
            continue;
        }
        clients_cron_resize_query_buffer(app, client, now);
        clients_cron_track_peak_memory(app, client, slot);
        clients_cron_track_memory_usage(app, client);
    }
}

fn clients_cron_handle_timeout(app: &mut ServerApp, client: ClientId, now: u64) -> bool {
    let (blocked_deadline, idle_exempt, last_interaction) = {
        let Some(session) = app.sessions.get(&client) else {
            return true;
        };
        let exempt_flags = SessionFlags::REPLICA_LINK
            .union(SessionFlags::PRIMARY_LINK)
            .union(SessionFlags::OBSERVER)
            .union(SessionFlags::PUBSUB_MODE);
        (
            session.blocked.as_ref().and_then(|blocked| blocked.deadline),
            session.flags.intersects(exempt_flags) || session.is_blocked(),
            session.last_interaction,
        )
    };

    if let Some(deadline) = blocked_deadline {
        if deadline <= now {
            app.finish_blocked_wait_with_timeout(client);
            return true;
        }
    }

    let timeout_secs = app.config.client_timeout_secs;
    if timeout_secs > 0
        && !idle_exempt
        && now.saturating_sub(last_interaction) > timeout_secs * 1000
    {
        tracing::info!(client, "closing idle connection");
        app.disconnect_session(client);
        let _ = app.rotation.pop_front();
        return true;
    }
    false
}

fn clients_cron_resize_query_buffer(app: &mut ServerApp, client: ClientId, now: u64) {
    let shrink_threshold = app.config.query_buffer_shrink_bytes;
    let Some(session) = app.sessions.get_mut(&client) else {
        return;
    };
    let capacity = session.query_buffer.capacity();
    let idle_secs = now.saturating_sub(session.last_interaction) / 1000;
    if capacity > shrink_threshold
        && (capacity / (session.query_buffer_peak + 1) > 2 || idle_secs > 2)
    {
        session.query_buffer.shrink_to_fit();
    }
    // Re-arm peak tracking for the next cycle.
    session.query_buffer_peak = 0;
}

fn clients_cron_track_peak_memory(app: &mut ServerApp, client: ClientId, slot: usize) {
    let Some(session) = app.sessions.get(&client) else {
        return;
    };
    let in_usage = session.query_buffer.capacity();
    let out_usage = session.pending_out.len() * 64;
    if in_usage > app.state.peak_input_memory[slot] {
        app.state.peak_input_memory[slot] = in_usage;
    }
    if out_usage > app.state.peak_output_memory[slot] {
        app.state.peak_output_memory[slot] = out_usage;
    }
}

fn clients_cron_track_memory_usage(app: &mut ServerApp, client: ClientId) {
    let Some(session) = app.sessions.get_mut(&client) else {
        return;
    };
    let usage = session.estimated_memory();
    let category = session.memory_category();
    // Replace this connection's previous contribution so the aggregate
    // stays accurate without a full rescan.
    let previous = &mut app.state.session_memory_by_category[session.cron_memory_category];
    *previous = previous.saturating_sub(session.cron_memory_usage);
    app.state.session_memory_by_category[category] += usage;
    session.cron_memory_usage = usage;
    session.cron_memory_category = category;
}

/// The dataset-maintenance pass: active expiration plus incremental
/// resize/rehash, skipped while a background child is writing.
pub(crate) fn databases_cron(app: &mut ServerApp) {
    if app.config.active_expire && app.state.role == NodeRole::Primary {
        active_expire_cycle(app, false);
    }
    // Replicas never decide expiration themselves; the primary's explicit
    // deletes arrive over the link.

    if app.children.has_active_child() {
        return;
    }

    let dbs = u32::from(app.config.databases.get());
    let per_tick = u32::from(CRON_DBS_PER_TICK).min(dbs);
    for _ in 0..per_tick {
        let db = (app.cron.resize_cursor % dbs) as u16;
        app.cron.resize_cursor = app.cron.resize_cursor.wrapping_add(1);
        if app.store.needs_resize(db) {
            app.store.begin_resize(db);
        }
    }

    let started = Instant::now();
    for _ in 0..dbs {
        let db = (app.cron.rehash_cursor % dbs) as u16;
        if app.store.resize_in_progress(db) {
            while app.store.rehash_step(db, 64) {
                if started.elapsed() >= REHASH_BUDGET {
                    return;
                }
            }
            app.cron.rehash_cursor = app.cron.rehash_cursor.wrapping_add(1);
            return;
        }
        app.cron.rehash_cursor = app.cron.rehash_cursor.wrapping_add(1);
    }
}

/// Samples volatile keys and removes those past their deadline, recording
/// an explicit delete per removal. High observed staleness keeps the
/// cycle sampling the same keyspace, bounded by the time budget.
pub(crate) fn active_expire_cycle(app: &mut ServerApp, fast: bool) {
    let ServerApp {
        config,
        state,
        store,
        log,
        feed,
        cron,
        ..
    } = app;
    if state.role != NodeRole::Primary {
        return;
    }

    let budget = if fast {
        EXPIRE_FAST_BUDGET
    } else {
        Duration::from_micros(1_000_000 * EXPIRE_SLOW_BUDGET_PCT / 100 / u64::from(state.hz.max(1)))
    };
    let started = Instant::now();
    let now = state.unix_ms;
    let dbs = u32::from(config.databases.get());

    for _ in 0..dbs {
        let db = (cron.expire_db_cursor % dbs) as u16;
        loop {
            if store.expires_count(db) == 0 {
                break;
            }
            let sampled =
                store.sample_expires(db, cron.expire_sample_offset, EXPIRE_LOOKUPS_PER_LOOP);
            cron.expire_sample_offset = cron.expire_sample_offset.wrapping_add(sampled.len());
            if sampled.is_empty() {
                break;
            }

            let mut expired = 0_usize;
            for (key, deadline) in &sampled {
                if *deadline <= now && store.remove(db, key) {
                    state.stat_expired_keys += 1;
                    let record = CommandFrame::new("DEL", vec![key.clone()]);
                    propagate(&mut *log, &mut *feed, db, &record, PropTarget::ALL);
                    expired += 1;
                }
            }
            if started.elapsed() >= budget {
                return;
            }
            if expired * 100 < sampled.len() * EXPIRE_STALE_PCT {
                break;
            }
        }
        cron.expire_db_cursor = cron.expire_db_cursor.wrapping_add(1);
        if started.elapsed() >= budget {
            return;
        }
    }
}

fn maybe_start_snapshot_from_save_points(app: &mut ServerApp) {
    let now = app.state.unix_ms;
    let changes = app.state.dirty.saturating_sub(app.state.dirty_at_last_snapshot);
    let save_points = app.config.save_points.clone();
    for save_point in &save_points {
        let window_reached =
            now.saturating_sub(app.state.last_snapshot_at) > save_point.seconds * 1000;
        let retry_ok = app.state.snapshot_status == PersistStatus::Ok
            || now.saturating_sub(app.state.last_snapshot_try_at)
                > app.config.snapshot_retry_secs * 1000;
        if changes >= save_point.changes && window_reached && retry_ok {
            tracing::info!(
                changes,
                seconds = save_point.seconds,
                "save point reached, starting background snapshot"
            );
            start_snapshot(app);
            break;
        }
    }
}

fn start_snapshot(app: &mut ServerApp) {
    app.state.last_snapshot_try_at = app.state.unix_ms;
    let clone = app.store.clone();
    let _ = app
        .children
        .start(ChildKind::Snapshot, clone, app.state.dirty, app.state.unix_ms);
}

fn maybe_start_growth_rewrite(app: &mut ServerApp) {
    if !app.log.enabled() || app.config.log_rewrite_growth_pct == 0 {
        return;
    }
    if app.log.current_bytes() <= app.config.log_rewrite_min_bytes {
        return;
    }
    let growth = app.log.growth_pct();
    if growth >= app.config.log_rewrite_growth_pct {
        tracing::info!(growth, "starting automatic log rewrite");
        start_log_rewrite(app);
    }
}

pub(crate) fn start_log_rewrite(app: &mut ServerApp) {
    if app.children.has_active_child() {
        app.children.log_rewrite_scheduled = true;
        return;
    }
    let clone = app.store.clone();
    let _ = app
        .children
        .start(ChildKind::LogRewrite, clone, app.state.dirty, app.state.unix_ms);
}

fn handle_child_report(app: &mut ServerApp, report: ChildReport, dirty_baseline: u64) {
    match report.kind {
        ChildKind::Snapshot => {
            if report.ok {
                app.state.snapshot_status = PersistStatus::Ok;
                app.state.last_snapshot_at = app.state.unix_ms;
                app.state.dirty_at_last_snapshot = dirty_baseline;
                tracing::info!(bytes = report.bytes, "background snapshot finished");
            } else {
                app.state.snapshot_status = PersistStatus::Failed;
                tracing::warn!("background snapshot failed; write acceptance may suspend");
            }
        }
        ChildKind::LogRewrite => {
            if report.ok {
                let compacted = report
                    .compacted
                    .into_iter()
                    .map(|(db, frame)| LogRecord { db, frame })
                    .collect();
                app.log.complete_rewrite(compacted);
            } else {
                tracing::warn!("log rewrite child failed; keeping the previous log");
            }
        }
    }
}

fn prepare_shutdown(app: &mut ServerApp, kind: ShutdownKind) -> bool {
    tracing::warn!(?kind, "user requested shutdown");
    let mut kind = kind;
    if app.state.loading {
        // Never overwrite the snapshot with a half-read dataset.
        kind = ShutdownKind::NoSave;
    }
    app.children.terminate_active();

    let save = matches!(kind, ShutdownKind::Save)
        || (matches!(kind, ShutdownKind::Default) && !app.config.save_points.is_empty());
    if save {
        let records = app.store.export_records();
        tracing::info!(records = records.len(), "final snapshot written");
        app.state.dirty_at_last_snapshot = app.state.dirty;
        app.state.last_snapshot_at = app.state.unix_ms;
    }

    app.log.flush();
    if app.log.last_write_status() == PersistStatus::Failed && !matches!(kind, ShutdownKind::NoSave)
    {
        return false;
    }
    true
}

/// Replica-link health: ping downstream replicas so lag stays measurable
/// and refresh the good-replica count the quorum gate reads; on a replica
/// with a broken link, note the reconnect intent.
pub(crate) fn replication_cron(app: &mut ServerApp) {
    match app.state.role {
        NodeRole::Primary => {
            if app.feed.replica_count() > 0 {
                app.feed.ping_replicas();
            }
            app.state.good_replicas = app
                .feed
                .good_replicas(app.state.unix_ms, app.config.min_replicas_max_lag_secs);
        }
        NodeRole::Replica => {
            if app.state.link == LinkState::Broken {
                tracing::info!("upstream link down, scheduling reconnect attempt");
            }
        }
    }
}
