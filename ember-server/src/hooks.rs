//! Event-loop hooks run immediately around the I/O wait.
//!
//! Everything latency-sensitive that must not wait for the next cron tick
//! happens in `before_sleep`; `after_sleep` is limited to synchronizing
//! with the serialization workers, since the rest can wait for the next
//! iteration's before-hook.

use ember_core::keyspace::DataStore;
use ember_core::propagation::DurableLogWriter;
use ember_core::state::NodeRole;

use crate::app::ServerApp;
use crate::cron::active_expire_cycle;

/// Work performed before the process waits for I/O readiness.
pub fn before_sleep(app: &mut ServerApp) {
    let used = app.store.memory_used();
    if used > app.state.stat_peak_memory {
        app.state.stat_peak_memory = used;
    }

    // Connections that became free to close go first so their resources
    // are gone before anything else touches the session table.
    let _ = app.free_closing_sessions();

    // Precise timeouts for blocked clients.
    app.unblock_timed_out();

    // A fast, tightly-bounded expiration pass.
    if app.config.active_expire && app.state.role == NodeRole::Primary {
        active_expire_cycle(app, true);
    }

    // Clients waiting on synchronous-replication acknowledgements.
    app.serve_ack_waiters();

    // Commands pipelined behind a wait that just resolved.
    app.process_unblocked_sessions();

    // If a wait started during the last loop iteration, ask the replicas
    // for an acknowledgement round-trip now instead of at the next cron.
    if app.state.get_ack_from_replicas {
        app.feed.request_acks();
        app.state.get_ack_from_replicas = false;
    }

    // Client-side-cache invalidation notifications.
    app.broadcast_invalidations();

    // Durable-log buffer to its backing store.
    app.log.flush();
    app.state.log_status = app.log.last_write_status();

    // Hand pending reply serialization to the worker pool.
    app.flush_pending_replies();
    app.drain_worker_output();

    // Blocked clients whose keys became ready outside the command path.
    app.serve_ready_keys();
}

/// Work performed right after the I/O wait returns: nothing beyond
/// worker synchronization.
pub fn after_sleep(app: &mut ServerApp) {
    app.drain_worker_output();
}
