//! Publish/subscribe command handlers.

use crate::command::{CommandFrame, CommandReply};
use crate::flags::SessionFlags;
use crate::session::Session;

use super::CallContext;

pub(crate) fn handle_subscribe(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let mut confirmations = Vec::with_capacity(frame.args.len());
    for channel in &frame.args {
        let _ = ctx.engine.pubsub.subscribe(session.id, channel);
        let _ = session.subscriptions.insert(channel.clone());
        confirmations.push(CommandReply::Array(vec![
            CommandReply::BulkString(b"subscribe".to_vec()),
            CommandReply::BulkString(channel.clone()),
            CommandReply::Integer(session.subscriptions.len() as i64),
        ]));
    }
    session.flags.insert(SessionFlags::PUBSUB_MODE);

    // One confirmation per channel; the first rides the normal reply
    // channel and the rest are queued as pushes.
    let first = confirmations.remove(0);
    session.pending_out.extend(confirmations);
    first
}

pub(crate) fn handle_unsubscribe(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let channels: Vec<Vec<u8>> = if frame.args.is_empty() {
        session.subscriptions.iter().cloned().collect()
    } else {
        frame.args.clone()
    };

    if channels.is_empty() {
        return CommandReply::Array(vec![
            CommandReply::BulkString(b"unsubscribe".to_vec()),
            CommandReply::Null,
            CommandReply::Integer(0),
        ]);
    }

    let mut confirmations = Vec::with_capacity(channels.len());
    for channel in &channels {
        let _ = ctx.engine.pubsub.unsubscribe(session.id, channel);
        let _ = session.subscriptions.remove(channel);
        confirmations.push(CommandReply::Array(vec![
            CommandReply::BulkString(b"unsubscribe".to_vec()),
            CommandReply::BulkString(channel.clone()),
            CommandReply::Integer(session.subscriptions.len() as i64),
        ]));
    }
    if session.subscriptions.is_empty() {
        session.flags.remove(SessionFlags::PUBSUB_MODE);
    }

    let first = confirmations.remove(0);
    session.pending_out.extend(confirmations);
    first
}

pub(crate) fn handle_publish(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    frame: &CommandFrame,
) -> CommandReply {
    let receivers = ctx.engine.pubsub.publish(&frame.args[0], &frame.args[1]);

    // Message delivery mutates nothing, yet every replica must observe the
    // publication for its own subscribers.
    session.flags.insert(SessionFlags::FORCE_REPL);
    CommandReply::Integer(receivers as i64)
}
