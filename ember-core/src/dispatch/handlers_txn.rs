//! Transaction control handlers.
//!
//! `MULTI` opens the connection-scoped queue, `EXEC` commits it through
//! nested dispatcher calls, and the queued writes travel to the durable
//! log and the replicas inside one `MULTI`/`EXEC` envelope emitted lazily
//! when the first queued write is reached.

use crate::command::{CommandFrame, CommandReply};
use crate::flags::{CallFlags, CommandFlags, SessionFlags};
use crate::propagation::{propagate, PropTarget};
use crate::session::Session;

use super::{call, CallContext};

pub(crate) fn handle_multi(
    _ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    if !session.tx.begin() {
        return CommandReply::Error("ERR MULTI calls can not be nested".to_owned());
    }
    CommandReply::ok()
}

pub(crate) fn handle_discard(
    _ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    if !session.tx.discard() {
        return CommandReply::Error("ERR DISCARD without MULTI".to_owned());
    }
    session.unwatch();
    CommandReply::ok()
}

pub(crate) fn handle_watch(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    if session.tx.is_open() {
        return CommandReply::Error("ERR WATCH inside MULTI is not allowed".to_owned());
    }
    for key in &frame.args {
        let version = ctx.engine.store.key_version(session.db, key);
        session.watch_key(session.db, key.clone(), version);
    }
    CommandReply::ok()
}

pub(crate) fn handle_unwatch(
    _ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    session.unwatch();
    CommandReply::ok()
}

pub(crate) fn handle_exec(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    if !session.tx.is_open() {
        return CommandReply::Error("ERR EXEC without MULTI".to_owned());
    }
    if session.tx.is_aborted() {
        let _ = session.tx.discard();
        session.unwatch();
        return CommandReply::Error(
            "EXECABORT Transaction discarded because of previous errors.".to_owned(),
        );
    }

    let watched_clean = {
        let store = &*ctx.engine.store;
        session.watched_keys_clean(|db, key| store.key_version(db, key))
    };
    if !watched_clean {
        let _ = session.tx.discard();
        session.unwatch();
        return CommandReply::NullArray;
    }

    let Some(queued) = session.tx.take_for_commit() else {
        return CommandReply::Error("ERR EXEC without MULTI".to_owned());
    };
    session.unwatch();
    if queued.is_empty() {
        return CommandReply::Array(Vec::new());
    }

    let registry = ctx.engine.registry;
    let nested_flags = CallFlags::SLOWLOG
        .union(CallFlags::STATS)
        .union(ctx.call_flags.intersection(CallFlags::PROPAGATE));
    let mut envelope_target = PropTarget::NONE;
    if ctx.call_flags.contains(CallFlags::PROPAGATE_LOG) {
        envelope_target.insert(PropTarget::LOG);
    }
    if ctx.call_flags.contains(CallFlags::PROPAGATE_REPL) {
        envelope_target.insert(PropTarget::REPL);
    }

    session.flags.insert(SessionFlags::IN_EXEC);
    let mut envelope_open = false;
    let mut replies = Vec::with_capacity(queued.len());
    for queued_frame in &queued {
        let Some(spec) = registry.lookup(&queued_frame.name) else {
            replies.push(CommandReply::Error(format!(
                "ERR unknown command '{}'",
                queued_frame.name
            )));
            continue;
        };

        // The envelope opens right before the first queued write so
        // read-only transactions never pollute the log.
        if spec.flags.contains(CommandFlags::WRITE)
            && !envelope_open
            && !envelope_target.is_empty()
        {
            let begin = CommandFrame::new("MULTI", Vec::new());
            propagate(
                &mut *ctx.engine.log,
                &mut *ctx.engine.feed,
                session.db,
                &begin,
                envelope_target,
            );
            envelope_open = true;
        }

        let outcome = call(ctx.engine, session, spec, queued_frame, nested_flags, None);
        replies.push(outcome.reply.unwrap_or(CommandReply::NullArray));
    }
    if envelope_open {
        // Count the envelope itself as a mutation so the enclosing call
        // propagates this EXEC and closes the begin marker.
        ctx.engine.state.dirty += 1;
    }
    session.flags.remove(SessionFlags::IN_EXEC);

    CommandReply::Array(replies)
}
