//! The call core.
//!
//! [`call`] is the single funnel every admitted command runs through: it
//! mirrors the invocation to observers, isolates the session's per-call
//! propagation flags, measures the dirty delta and wall time around the
//! handler, feeds statistics and the slow-command log, decides propagation
//! exactly once, flushes extra ops with envelope wrapping, and restores
//! the session flags so nested invocations compose.

use std::time::Instant;

use ember_common::config::RuntimeConfig;
use ember_common::ids::{DbIndex, UnixMillis};

use crate::acl::AccessControl;
use crate::command::{CommandFrame, CommandReply};
use crate::flags::{CallFlags, CommandFlags, SessionFlags};
use crate::keyspace::DataStore;
use crate::observer::ObserverFeed;
use crate::propagation::{
    propagate, DurableLogWriter, Op, PropTarget, PropagationBuffer, ReplicaBroadcaster,
};
use crate::pubsub::PubSubHub;
use crate::registry::{CommandRegistry, CommandSpec};
use crate::routing::SlotOwnership;
use crate::session::Session;
use crate::state::{NodeRole, ServerState};

#[path = "dispatch/parse.rs"]
pub(crate) mod parse;

#[path = "dispatch/handlers_connection.rs"]
pub(crate) mod handlers_connection;
#[path = "dispatch/handlers_expiry.rs"]
pub(crate) mod handlers_expiry;
#[path = "dispatch/handlers_keyspace.rs"]
pub(crate) mod handlers_keyspace;
#[path = "dispatch/handlers_list.rs"]
pub(crate) mod handlers_list;
#[path = "dispatch/handlers_pubsub.rs"]
pub(crate) mod handlers_pubsub;
#[path = "dispatch/handlers_string.rs"]
pub(crate) mod handlers_string;
#[path = "dispatch/handlers_txn.rs"]
pub(crate) mod handlers_txn;

#[cfg(test)]
#[path = "dispatch/tests.rs"]
mod tests;

/// Handler callback signature used by command table entries.
pub type CommandHandler =
    fn(&mut CallContext<'_, '_>, &mut Session, &CommandFrame) -> CommandReply;

/// Borrowed view over every collaborator the execution core touches.
///
/// The composition root owns all of these; one `EngineContext` is
/// assembled per dispatched command and threaded through admission and
/// the call core, making the single-threaded ownership contract explicit
/// in the signatures.
pub struct EngineContext<'a> {
    /// Runtime configuration.
    pub config: &'a RuntimeConfig,
    /// Server-wide execution state.
    pub state: &'a mut ServerState,
    /// The dataset.
    pub store: &'a mut dyn DataStore,
    /// Command table.
    pub registry: &'a CommandRegistry,
    /// Durable command log sink.
    pub log: &'a mut dyn DurableLogWriter,
    /// Replica stream sink.
    pub feed: &'a mut dyn ReplicaBroadcaster,
    /// Observer mirror feed.
    pub observers: &'a mut ObserverFeed,
    /// Publish/subscribe hub.
    pub pubsub: &'a mut PubSubHub,
    /// Access-control table.
    pub acl: &'a AccessControl,
    /// Cluster slot-ownership view.
    pub cluster: &'a dyn SlotOwnership,
}

/// Per-call view handed to command handlers: the engine plus the call's
/// propagation accumulation state.
pub struct CallContext<'c, 'a> {
    /// The shared engine collaborators.
    pub engine: &'c mut EngineContext<'a>,
    /// Extra-op buffer local to this call.
    pub props: &'c mut PropagationBuffer,
    /// Flags of the enclosing dispatcher invocation.
    pub call_flags: CallFlags,
}

impl CallContext<'_, '_> {
    /// Cached wall-clock milliseconds.
    #[must_use]
    pub fn now(&self) -> UnixMillis {
        self.engine.state.unix_ms
    }

    /// Schedules an extra op to be flushed after this call's own
    /// propagation decision. Dropped silently while a dataset load is
    /// replaying records.
    pub fn also_propagate(&mut self, db: DbIndex, frame: CommandFrame, target: PropTarget) {
        if self.engine.state.loading {
            return;
        }
        self.props.push(Op { db, frame, target });
    }

    /// Replaces the record propagated for the invoked command, used when a
    /// non-deterministic invocation must be recorded as its deterministic
    /// equivalent.
    pub fn rewrite_as(&mut self, frame: CommandFrame) {
        self.props.rewritten = Some(frame);
    }

    /// Lazily expires `key` if its deadline has passed.
    ///
    /// On a primary the key is removed and an explicit `DEL` op is
    /// scheduled for the log and the replicas. On a replica the key is
    /// only reported as logically expired; the primary's delete record is
    /// what actually removes it.
    pub fn expire_if_needed(&mut self, db: DbIndex, key: &[u8]) -> bool {
        let now = self.engine.state.unix_ms;
        let Some(deadline) = self.engine.store.expire_time(db, key) else {
            return false;
        };
        if deadline > now {
            return false;
        }
        if self.engine.state.role == NodeRole::Replica {
            return true;
        }

        let _ = self.engine.store.remove(db, key);
        self.engine.state.stat_expired_keys += 1;
        self.also_propagate(db, CommandFrame::new("DEL", vec![key.to_vec()]), PropTarget::ALL);
        true
    }
}

/// Result of one dispatcher invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    /// The handler's reply, or `None` when the session entered a blocking
    /// wait and the reply is deferred.
    pub reply: Option<CommandReply>,
    /// Dataset mutations attributed to this call.
    pub dirty_delta: u64,
}

/// Executes one admitted command.
///
/// `outer_flags`, when present, receives the force-propagation flags the
/// handler raised, so a pseudo-session driving nested invocations can
/// carry them back to its own propagation decision.
pub fn call(
    engine: &mut EngineContext<'_>,
    session: &mut Session,
    spec: &CommandSpec,
    frame: &CommandFrame,
    call_flags: CallFlags,
    outer_flags: Option<&mut SessionFlags>,
) -> CallOutcome {
    if !engine.observers.is_empty()
        && !engine.state.loading
        && !spec
            .flags
            .intersects(CommandFlags::ADMIN.union(CommandFlags::SKIP_OBSERVER))
    {
        let now = engine.state.unix_ms;
        engine.observers.mirror(now, session.db, frame);
    }

    let prior_flags = session.flags;
    session.flags.remove(SessionFlags::PROPAGATION_CONTROL);

    let was_blocked = session.is_blocked();
    let dirty_before = engine.state.dirty;

    // Nested calls share the clock value cached by the outermost call so
    // every expiration decision inside one invocation sees the same time.
    if engine.state.fixed_time_expire == 0 {
        engine.state.refresh_cached_time();
    }
    engine.state.fixed_time_expire += 1;

    let started = Instant::now();
    let mut props = PropagationBuffer::default();
    let reply = {
        let mut ctx = CallContext {
            engine: &mut *engine,
            props: &mut props,
            call_flags,
        };
        (spec.handler)(&mut ctx, session, frame)
    };
    let duration_micros = started.elapsed().as_micros() as u64;
    let dirty_delta = engine.state.dirty.saturating_sub(dirty_before);

    if session.flags.contains(SessionFlags::CLOSE_AFTER_COMMAND) {
        session.flags.remove(SessionFlags::CLOSE_AFTER_COMMAND);
        session.flags.insert(SessionFlags::CLOSE_AFTER_REPLY);
    }

    // Replaying the durable log must not pollute introspection data.
    let mut call_flags = call_flags;
    if engine.state.loading {
        call_flags.remove(CallFlags::SLOWLOG.union(CallFlags::STATS));
    }

    if call_flags.contains(CallFlags::SLOWLOG)
        && !spec.flags.contains(CommandFlags::SKIP_SLOWLOG)
    {
        engine.state.record_slowlog(
            engine.config.slowlog_threshold_micros,
            engine.config.slowlog_max_len,
            frame,
            duration_micros,
        );
    }
    if call_flags.contains(CallFlags::STATS) {
        engine.state.note_command_call(spec.name, duration_micros);
    }

    // The propagation decision, made exactly once, after the call.
    if call_flags.intersects(CallFlags::PROPAGATE)
        && !session
            .flags
            .contains(SessionFlags::PREVENT_LOG.union(SessionFlags::PREVENT_REPL))
    {
        let mut target = PropTarget::NONE;
        if dirty_delta > 0 {
            target = PropTarget::ALL;
        }
        if session.flags.contains(SessionFlags::FORCE_REPL) {
            target.insert(PropTarget::REPL);
        }
        if session.flags.contains(SessionFlags::FORCE_LOG) {
            target.insert(PropTarget::LOG);
        }
        if session.flags.contains(SessionFlags::PREVENT_REPL)
            || !call_flags.contains(CallFlags::PROPAGATE_REPL)
        {
            target.remove(PropTarget::REPL);
        }
        if session.flags.contains(SessionFlags::PREVENT_LOG)
            || !call_flags.contains(CallFlags::PROPAGATE_LOG)
        {
            target.remove(PropTarget::LOG);
        }
        if !target.is_empty() {
            let record = props.rewritten.clone().unwrap_or_else(|| frame.clone());
            propagate(&mut *engine.log, &mut *engine.feed, session.db, &record, target);
        }
    }

    // Restore the caller's propagation-control flags; forces raised by the
    // handler bubble to the outer pseudo-session when one exists.
    let forced_here = session.flags.intersection(SessionFlags::FORCE_MASK);
    session.flags.remove(SessionFlags::PROPAGATION_CONTROL);
    session
        .flags
        .insert(prior_flags.intersection(SessionFlags::PROPAGATION_CONTROL));
    if let Some(outer) = outer_flags {
        outer.insert(forced_here);
    }

    flush_extra_ops(engine, session, &mut props, call_flags);

    if spec.flags.contains(CommandFlags::READONLY)
        && session.flags.contains(SessionFlags::TRACKING)
    {
        for key in spec.key_args(frame) {
            let _ = session.tracked_keys.insert(key.to_vec());
        }
    }

    engine.state.fixed_time_expire = engine.state.fixed_time_expire.saturating_sub(1);
    engine.state.stat_commands += 1;
    let used = engine.store.memory_used();
    if used > engine.state.stat_peak_memory {
        engine.state.stat_peak_memory = used;
    }

    let newly_blocked = !was_blocked && session.is_blocked();
    CallOutcome {
        reply: if newly_blocked { None } else { Some(reply) },
        dirty_delta,
    }
}

/// Flushes the extra ops accumulated during one call.
///
/// More than one op outside an already-open transaction envelope is
/// wrapped in `MULTI`/`EXEC` markers so replay and replica application see
/// the group atomically; a single op needs no wrapper. Each op's target is
/// filtered against the call-level propagation flags first.
fn flush_extra_ops(
    engine: &mut EngineContext<'_>,
    session: &Session,
    props: &mut PropagationBuffer,
    call_flags: CallFlags,
) {
    let ops = props.take_ops();
    if ops.is_empty() || !call_flags.intersects(CallFlags::PROPAGATE) {
        return;
    }

    let mut filtered = Vec::with_capacity(ops.len());
    for mut op in ops {
        if !call_flags.contains(CallFlags::PROPAGATE_LOG) {
            op.target.remove(PropTarget::LOG);
        }
        if !call_flags.contains(CallFlags::PROPAGATE_REPL) {
            op.target.remove(PropTarget::REPL);
        }
        if !op.target.is_empty() {
            filtered.push(op);
        }
    }
    if filtered.is_empty() {
        return;
    }

    let wrap = filtered.len() > 1
        && !session.flags.contains(SessionFlags::IN_EXEC)
        && !call_flags.contains(CallFlags::NO_WRAP);
    let envelope_target = filtered
        .iter()
        .fold(PropTarget::NONE, |mask, op| mask.union(op.target));

    if wrap {
        let begin = CommandFrame::new("MULTI", Vec::new());
        propagate(&mut *engine.log, &mut *engine.feed, session.db, &begin, envelope_target);
    }
    for op in &filtered {
        propagate(&mut *engine.log, &mut *engine.feed, op.db, &op.frame, op.target);
    }
    if wrap {
        let end = CommandFrame::new("EXEC", Vec::new());
        propagate(&mut *engine.log, &mut *engine.feed, session.db, &end, envelope_target);
    }
}
