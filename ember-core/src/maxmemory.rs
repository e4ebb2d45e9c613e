//! Memory-ceiling enforcement.
//!
//! Runs as part of admission, before the out-of-memory verdict: when a
//! ceiling is configured the server first tries to reclaim memory by
//! evicting sampled keys under the configured policy, and only rejects the
//! command when reclamation cannot get usage back under the ceiling.
//! Evicted keys propagate as explicit `DEL` records immediately, outside
//! any per-call buffering, since eviction is not an effect of the command
//! being admitted.

use ember_common::config::{MaxmemoryPolicy, RuntimeConfig};
use ember_common::ids::DbIndex;

use crate::command::CommandFrame;
use crate::keyspace::DataStore;
use crate::propagation::{propagate, DurableLogWriter, PropTarget, ReplicaBroadcaster};
use crate::state::ServerState;

/// Attempts to bring memory use under the configured ceiling.
///
/// Returns `true` when usage is (now) under the ceiling, `false` when the
/// policy forbids eviction or no candidate is left.
pub fn free_memory_if_needed(
    config: &RuntimeConfig,
    state: &mut ServerState,
    store: &mut dyn DataStore,
    log: &mut dyn DurableLogWriter,
    feed: &mut dyn ReplicaBroadcaster,
) -> bool {
    let limit = config.maxmemory_bytes;
    if limit == 0 {
        return true;
    }

    loop {
        if store.memory_used() <= limit {
            return true;
        }
        if config.maxmemory_policy == MaxmemoryPolicy::NoEviction {
            return false;
        }
        let Some((db, key)) = pick_candidate(config, state, store) else {
            return false;
        };

        let _ = store.remove(db, &key);
        state.stat_evicted_keys += 1;
        let record = CommandFrame::new("DEL", vec![key]);
        propagate(log, feed, db, &record, PropTarget::ALL);
    }
}

fn pick_candidate(
    config: &RuntimeConfig,
    state: &ServerState,
    store: &dyn DataStore,
) -> Option<(DbIndex, Vec<u8>)> {
    let rotation = state.cronloops as usize;
    for db in 0..config.databases.get() {
        let candidate = match config.maxmemory_policy {
            MaxmemoryPolicy::NoEviction => None,
            MaxmemoryPolicy::VolatileRandom => store
                .sample_expires(db, rotation, 1)
                .into_iter()
                .next()
                .map(|(key, _)| key),
            MaxmemoryPolicy::AllkeysRandom => store.sample_keys(db, 1).into_iter().next(),
        };
        if let Some(key) = candidate {
            return Some((db, key));
        }
    }
    None
}
