//! Connection and administrative command handlers.

use crate::command::{CommandFrame, CommandReply};
use crate::flags::SessionFlags;
use crate::session::{BlockReason, BlockedState, Session};
use crate::state::ShutdownKind;

use super::parse::parse_u64;
use super::CallContext;

pub(crate) fn handle_ping(
    _ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    if session.flags.contains(SessionFlags::PUBSUB_MODE) {
        let payload = frame.args.first().cloned().unwrap_or_default();
        return CommandReply::Array(vec![
            CommandReply::BulkString(b"pong".to_vec()),
            CommandReply::BulkString(payload),
        ]);
    }
    match frame.args.len() {
        0 => CommandReply::SimpleString("PONG".to_owned()),
        1 => CommandReply::BulkString(frame.args[0].clone()),
        _ => CommandReply::Error("ERR wrong number of arguments for 'ping' command".to_owned()),
    }
}

pub(crate) fn handle_echo(
    _ctx: &mut CallContext<'_, '_>,
    _session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    CommandReply::BulkString(frame.args[0].clone())
}

pub(crate) fn handle_auth(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let acl = ctx.engine.acl;
    if !acl.auth_required(&session.user) {
        return CommandReply::Error(
            "ERR Client sent AUTH, but no password is set".to_owned(),
        );
    }
    if acl.verify_password(&session.user, &frame.args[0]) {
        session.authenticated = true;
        return CommandReply::ok();
    }
    CommandReply::Error("WRONGPASS invalid username-password pair".to_owned())
}

pub(crate) fn handle_select(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let index = match parse_u64(&frame.args[0]) {
        Ok(index) => index,
        Err(message) => return CommandReply::Error(message),
    };
    if index >= u64::from(ctx.engine.config.databases.get()) {
        return CommandReply::Error("ERR DB index is out of range".to_owned());
    }
    session.db = index as u16;
    CommandReply::ok()
}

pub(crate) fn handle_shutdown(
    ctx: &mut CallContext<'_, '_>,
    _session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let kind = match frame.args.first() {
        None => ShutdownKind::Default,
        Some(arg) if arg.eq_ignore_ascii_case(b"NOSAVE") => ShutdownKind::NoSave,
        Some(arg) if arg.eq_ignore_ascii_case(b"SAVE") => ShutdownKind::Save,
        Some(_) => return CommandReply::Error("ERR syntax error".to_owned()),
    };
    // The cron performs the actual orderly exit on its next tick.
    ctx.engine.state.shutdown_requested = Some(kind);
    CommandReply::ok()
}

pub(crate) fn handle_monitor(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    session.flags.insert(SessionFlags::OBSERVER);
    ctx.engine.observers.attach(session.id);
    CommandReply::ok()
}

pub(crate) fn handle_script(
    ctx: &mut CallContext<'_, '_>,
    _session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let subcommand = frame.args[0].as_slice();
    if subcommand.eq_ignore_ascii_case(b"KILL") && frame.args.len() == 1 {
        if ctx.engine.state.script_timedout {
            ctx.engine.state.script_timedout = false;
            return CommandReply::ok();
        }
        return CommandReply::Error("NOTBUSY No scripts in execution right now.".to_owned());
    }
    CommandReply::Error(format!(
        "ERR unknown SCRIPT subcommand or wrong number of arguments for '{}'",
        String::from_utf8_lossy(subcommand)
    ))
}

pub(crate) fn handle_client(
    _ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let subcommand = frame.args[0].as_slice();
    if subcommand.eq_ignore_ascii_case(b"ID") && frame.args.len() == 1 {
        return CommandReply::Integer(session.id as i64);
    }
    if subcommand.eq_ignore_ascii_case(b"TRACKING") && frame.args.len() == 2 {
        let mode = frame.args[1].as_slice();
        if mode.eq_ignore_ascii_case(b"ON") {
            session.flags.insert(SessionFlags::TRACKING);
            return CommandReply::ok();
        }
        if mode.eq_ignore_ascii_case(b"OFF") {
            session.flags.remove(SessionFlags::TRACKING);
            session.tracked_keys.clear();
            return CommandReply::ok();
        }
        return CommandReply::Error("ERR syntax error".to_owned());
    }
    CommandReply::Error(format!(
        "ERR unknown CLIENT subcommand or wrong number of arguments for '{}'",
        String::from_utf8_lossy(subcommand)
    ))
}

pub(crate) fn handle_wait(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let required = match parse_u64(&frame.args[0]) {
        Ok(required) => required,
        Err(message) => return CommandReply::Error(message),
    };
    let timeout_ms = match parse_u64(&frame.args[1]) {
        Ok(timeout_ms) => timeout_ms,
        Err(message) => return CommandReply::Error(message),
    };

    let target_offset = ctx.engine.feed.current_offset();
    let acked = ctx.engine.feed.acked_replicas(target_offset);
    if acked as u64 >= required || session.flags.contains(SessionFlags::IN_EXEC) {
        return CommandReply::Integer(acked as i64);
    }

    let deadline = if timeout_ms == 0 {
        None
    } else {
        Some(ctx.now().saturating_add(timeout_ms))
    };
    session.blocked = Some(BlockedState {
        reason: BlockReason::ReplicaAcks {
            target_offset,
            required: required as usize,
        },
        deadline,
        retry: frame.clone(),
    });
    ctx.engine.state.get_ack_from_replicas = true;
    CommandReply::Null
}
