//! List command handlers, including the blocking pop.

use ember_common::ids::DbIndex;

use crate::command::{CommandFrame, CommandReply};
use crate::flags::SessionFlags;
use crate::session::{BlockReason, BlockedState, Session};

use super::parse::{parse_timeout_ms, WRONGTYPE};
use super::CallContext;

pub(crate) fn handle_lpush(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    push_elements(ctx, session, frame, true)
}

pub(crate) fn handle_rpush(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    push_elements(ctx, session, frame, false)
}

fn push_elements(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
    front: bool,
) -> CommandReply {
    let key = &frame.args[0];
    let _ = ctx.expire_if_needed(session.db, key);

    let mut length = 0;
    for element in &frame.args[1..] {
        match ctx
            .engine
            .store
            .push_list(session.db, key, element.clone(), front)
        {
            Err(_) => return CommandReply::Error(WRONGTYPE.to_owned()),
            Ok(new_length) => {
                ctx.engine.state.dirty += 1;
                length = new_length;
            }
        }
    }

    // The key just became ready for any blocked pops.
    ctx.engine.state.signal_key_ready(session.db, key);
    CommandReply::Integer(length as i64)
}

pub(crate) fn handle_lpop(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let key = &frame.args[0];
    if ctx.expire_if_needed(session.db, key) {
        return CommandReply::Null;
    }
    match ctx.engine.store.pop_list_front(session.db, key) {
        Err(_) => CommandReply::Error(WRONGTYPE.to_owned()),
        Ok(Some(element)) => {
            ctx.engine.state.dirty += 1;
            CommandReply::BulkString(element)
        }
        Ok(None) => CommandReply::Null,
    }
}

pub(crate) fn handle_llen(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let key = &frame.args[0];
    if ctx.expire_if_needed(session.db, key) {
        return CommandReply::Integer(0);
    }
    match ctx.engine.store.list_len(session.db, key) {
        Err(_) => CommandReply::Error(WRONGTYPE.to_owned()),
        Ok(length) => CommandReply::Integer(length as i64),
    }
}

pub(crate) fn handle_blpop(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let timeout_raw = &frame.args[frame.args.len() - 1];
    let timeout_ms = match parse_timeout_ms(timeout_raw) {
        Ok(timeout_ms) => timeout_ms,
        Err(message) => return CommandReply::Error(message),
    };
    let keys = &frame.args[..frame.args.len() - 1];

    for key in keys {
        let _ = ctx.expire_if_needed(session.db, key);
        match ctx.engine.store.pop_list_front(session.db, key) {
            Err(_) => return CommandReply::Error(WRONGTYPE.to_owned()),
            Ok(Some(element)) => {
                ctx.engine.state.dirty += 1;
                return CommandReply::Array(vec![
                    CommandReply::BulkString(key.clone()),
                    CommandReply::BulkString(element),
                ]);
            }
            Ok(None) => {}
        }
    }

    // Inside a committed transaction there is nothing to suspend; the
    // non-blocking variant of the outcome is returned instead.
    if session.flags.contains(SessionFlags::IN_EXEC) {
        return CommandReply::NullArray;
    }

    let awaited: Vec<(DbIndex, Vec<u8>)> =
        keys.iter().map(|key| (session.db, key.clone())).collect();
    let deadline = if timeout_ms == 0 {
        None
    } else {
        Some(ctx.now().saturating_add(timeout_ms))
    };
    ctx.engine.state.block_on_keys(session.id, &awaited);
    session.blocked = Some(BlockedState {
        reason: BlockReason::Keys { keys: awaited },
        deadline,
        retry: frame.clone(),
    });
    CommandReply::Null
}
