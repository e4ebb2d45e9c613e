//! String command handlers.

use crate::command::{CommandFrame, CommandReply};
use crate::session::Session;

use super::parse::{parse_i64, WRONGTYPE};
use super::CallContext;

pub(crate) fn handle_get(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let key = &frame.args[0];
    if ctx.expire_if_needed(session.db, key) {
        return CommandReply::Null;
    }
    match ctx.engine.store.get_string(session.db, key) {
        Err(_) => CommandReply::Error(WRONGTYPE.to_owned()),
        Ok(Some(value)) => CommandReply::BulkString(value),
        Ok(None) => CommandReply::Null,
    }
}

pub(crate) fn handle_set(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let key = frame.args[0].clone();
    let value = frame.args[1].clone();

    let mut expire_ms: Option<i64> = None;
    let mut if_absent = false;
    let mut if_present = false;
    let mut index = 2;
    while index < frame.args.len() {
        let option = frame.args[index].as_slice();
        if option.eq_ignore_ascii_case(b"NX") {
            if_absent = true;
            index += 1;
        } else if option.eq_ignore_ascii_case(b"XX") {
            if_present = true;
            index += 1;
        } else if option.eq_ignore_ascii_case(b"EX") || option.eq_ignore_ascii_case(b"PX") {
            if expire_ms.is_some() {
                return CommandReply::Error("ERR syntax error".to_owned());
            }
            let Some(raw) = frame.args.get(index + 1) else {
                return CommandReply::Error("ERR syntax error".to_owned());
            };
            let amount = match parse_i64(raw) {
                Ok(amount) => amount,
                Err(message) => return CommandReply::Error(message),
            };
            if amount <= 0 {
                return CommandReply::Error("ERR invalid expire time in 'set' command".to_owned());
            }
            let millis = if option.eq_ignore_ascii_case(b"EX") {
                amount.saturating_mul(1000)
            } else {
                amount
            };
            expire_ms = Some(millis);
            index += 2;
        } else {
            return CommandReply::Error("ERR syntax error".to_owned());
        }
    }
    if if_absent && if_present {
        return CommandReply::Error("ERR syntax error".to_owned());
    }

    let _ = ctx.expire_if_needed(session.db, &key);
    let exists = ctx.engine.store.key_exists(session.db, &key);
    if (if_absent && exists) || (if_present && !exists) {
        return CommandReply::Null;
    }

    ctx.engine.store.set_string(session.db, &key, value);
    if let Some(millis) = expire_ms {
        let deadline = ctx.now().saturating_add(millis as u64);
        let _ = ctx.engine.store.set_expire(session.db, &key, deadline);
    }
    ctx.engine.state.dirty += 1;
    CommandReply::ok()
}

pub(crate) fn handle_append(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let key = &frame.args[0];
    let _ = ctx.expire_if_needed(session.db, key);
    match ctx.engine.store.append_string(session.db, key, &frame.args[1]) {
        Err(_) => CommandReply::Error(WRONGTYPE.to_owned()),
        Ok(length) => {
            ctx.engine.state.dirty += 1;
            CommandReply::Integer(length as i64)
        }
    }
}

pub(crate) fn handle_strlen(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let key = &frame.args[0];
    if ctx.expire_if_needed(session.db, key) {
        return CommandReply::Integer(0);
    }
    match ctx.engine.store.get_string(session.db, key) {
        Err(_) => CommandReply::Error(WRONGTYPE.to_owned()),
        Ok(Some(value)) => CommandReply::Integer(value.len() as i64),
        Ok(None) => CommandReply::Integer(0),
    }
}

pub(crate) fn handle_incr(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    increment_by(ctx, session, frame, 1)
}

pub(crate) fn handle_decr(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    increment_by(ctx, session, frame, -1)
}

pub(crate) fn handle_incrby(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let delta = match parse_i64(&frame.args[1]) {
        Ok(delta) => delta,
        Err(message) => return CommandReply::Error(message),
    };
    increment_by(ctx, session, frame, delta)
}

fn increment_by(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
    delta: i64,
) -> CommandReply {
    let key = &frame.args[0];
    let _ = ctx.expire_if_needed(session.db, key);

    let current = match ctx.engine.store.get_string(session.db, key) {
        Err(_) => return CommandReply::Error(WRONGTYPE.to_owned()),
        Ok(None) => 0,
        Ok(Some(raw)) => match parse_i64(&raw) {
            Ok(current) => current,
            Err(message) => return CommandReply::Error(message),
        },
    };
    let Some(next) = current.checked_add(delta) else {
        return CommandReply::Error("ERR increment or decrement would overflow".to_owned());
    };

    // Counters keep their expiration deadline across updates.
    let deadline = ctx.engine.store.expire_time(session.db, key);
    ctx.engine
        .store
        .set_string(session.db, key, next.to_string().into_bytes());
    if let Some(at) = deadline {
        let _ = ctx.engine.store.set_expire(session.db, key, at);
    }
    ctx.engine.state.dirty += 1;
    CommandReply::Integer(next)
}

pub(crate) fn handle_mget(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let mut values = Vec::with_capacity(frame.args.len());
    for key in &frame.args {
        if ctx.expire_if_needed(session.db, key) {
            values.push(CommandReply::Null);
            continue;
        }
        match ctx.engine.store.get_string(session.db, key) {
            Ok(Some(value)) => values.push(CommandReply::BulkString(value)),
            _ => values.push(CommandReply::Null),
        }
    }
    CommandReply::Array(values)
}
