//! Generic keyspace command handlers.

use crate::command::{CommandFrame, CommandReply};
use crate::session::Session;

use super::CallContext;

pub(crate) fn handle_del(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let mut removed = 0_i64;
    for key in &frame.args {
        // An already-expired key counts as absent; its removal is the
        // expiration machinery's, not this command's.
        let _ = ctx.expire_if_needed(session.db, key);
        if ctx.engine.store.remove(session.db, key) {
            ctx.engine.state.dirty += 1;
            removed += 1;
        }
    }
    CommandReply::Integer(removed)
}

pub(crate) fn handle_exists(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let mut present = 0_i64;
    for key in &frame.args {
        if ctx.expire_if_needed(session.db, key) {
            continue;
        }
        if ctx.engine.store.key_exists(session.db, key) {
            present += 1;
        }
    }
    CommandReply::Integer(present)
}

pub(crate) fn handle_type(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let key = &frame.args[0];
    if ctx.expire_if_needed(session.db, key) {
        return CommandReply::SimpleString("none".to_owned());
    }
    match ctx.engine.store.value_kind(session.db, key) {
        Some(kind) => CommandReply::SimpleString(kind.to_owned()),
        None => CommandReply::SimpleString("none".to_owned()),
    }
}

pub(crate) fn handle_dbsize(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    CommandReply::Integer(ctx.engine.store.key_count(session.db) as i64)
}

pub(crate) fn handle_flushdb(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    let dropped = ctx.engine.store.flush_db(session.db);
    ctx.engine.state.dirty += dropped as u64;
    CommandReply::ok()
}

pub(crate) fn handle_flushall(
    ctx: &mut CallContext<'_, '_>,
    _session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    let dropped = ctx.engine.store.flush_all();
    ctx.engine.state.dirty += dropped as u64;
    CommandReply::ok()
}

pub(crate) fn handle_randomkey(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    match ctx.engine.store.random_key(session.db) {
        Some(key) => CommandReply::BulkString(key),
        None => CommandReply::Null,
    }
}
