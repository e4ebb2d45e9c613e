//! Expiration command handlers.
//!
//! Relative deadlines are rewritten into absolute `PEXPIREAT` records
//! before propagation, so replicas and replay never re-interpret "seconds
//! from now" against a different clock. Setting a deadline in the past on
//! a primary deletes the key immediately and records the deletion.

use crate::command::{CommandFrame, CommandReply};
use crate::session::Session;
use crate::state::NodeRole;

use super::parse::parse_i64;
use super::CallContext;

pub(crate) fn handle_expire(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    apply_expire(ctx, session, frame, 1000, true)
}

pub(crate) fn handle_pexpire(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    apply_expire(ctx, session, frame, 1, true)
}

pub(crate) fn handle_expireat(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    apply_expire(ctx, session, frame, 1000, false)
}

pub(crate) fn handle_pexpireat(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    apply_expire(ctx, session, frame, 1, false)
}

fn apply_expire(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
    unit_ms: i64,
    relative: bool,
) -> CommandReply {
    let key = frame.args[0].clone();
    let amount = match parse_i64(&frame.args[1]) {
        Ok(amount) => amount,
        Err(message) => return CommandReply::Error(message),
    };

    let _ = ctx.expire_if_needed(session.db, &key);
    if !ctx.engine.store.key_exists(session.db, &key) {
        return CommandReply::Integer(0);
    }

    let now = ctx.now();
    let scaled = i128::from(amount) * i128::from(unit_ms);
    let deadline_ms = if relative {
        i128::from(now) + scaled
    } else {
        scaled
    };
    let deadline_ms = deadline_ms.clamp(0, i128::from(u64::MAX)) as u64;

    if deadline_ms <= now {
        if ctx.engine.state.role == NodeRole::Primary {
            let _ = ctx.engine.store.remove(session.db, &key);
            ctx.engine.state.dirty += 1;
            ctx.rewrite_as(CommandFrame::new("DEL", vec![key]));
            return CommandReply::Integer(1);
        }
        // Replicas keep the key logically expired until the primary's
        // delete record arrives.
        let _ = ctx.engine.store.set_expire(session.db, &key, deadline_ms);
        ctx.engine.state.dirty += 1;
        return CommandReply::Integer(1);
    }

    let _ = ctx.engine.store.set_expire(session.db, &key, deadline_ms);
    ctx.engine.state.dirty += 1;
    ctx.rewrite_as(CommandFrame::new(
        "PEXPIREAT",
        vec![key, deadline_ms.to_string().into_bytes()],
    ));
    CommandReply::Integer(1)
}

pub(crate) fn handle_ttl(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    match remaining_ms(ctx, session, frame) {
        Some(Some(remaining)) => CommandReply::Integer(((remaining + 999) / 1000) as i64),
        Some(None) => CommandReply::Integer(-1),
        None => CommandReply::Integer(-2),
    }
}

pub(crate) fn handle_pttl(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    match remaining_ms(ctx, session, frame) {
        Some(Some(remaining)) => CommandReply::Integer(remaining as i64),
        Some(None) => CommandReply::Integer(-1),
        None => CommandReply::Integer(-2),
    }
}

/// `None`: key absent. `Some(None)`: present without deadline.
/// `Some(Some(ms))`: present with this much time left.
fn remaining_ms(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> Option<Option<u64>> {
    let key = &frame.args[0];
    if ctx.expire_if_needed(session.db, key) {
        return None;
    }
    if !ctx.engine.store.key_exists(session.db, key) {
        return None;
    }
    let now = ctx.now();
    match ctx.engine.store.expire_time(session.db, key) {
        Some(deadline) => Some(Some(deadline.saturating_sub(now))),
        None => Some(None),
    }
}

pub(crate) fn handle_persist(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let key = &frame.args[0];
    if ctx.expire_if_needed(session.db, key) {
        return CommandReply::Integer(0);
    }
    if ctx.engine.store.clear_expire(session.db, key) {
        ctx.engine.state.dirty += 1;
        return CommandReply::Integer(1);
    }
    CommandReply::Integer(0)
}
