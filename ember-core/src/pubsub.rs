//! Minimal publish/subscribe hub.
//!
//! Exists primarily so the reduced-protocol-mode admission gate has a real
//! surface to guard. Message deliveries are staged in the hub and drained
//! into the receiving sessions after the publishing command returns, since
//! the publisher's session is borrowed during execution.

use ember_common::ids::ClientId;

use crate::command::CommandReply;
use crate::containers::{HotMap, HotSet};

/// Channel subscription table plus staged deliveries.
#[derive(Debug, Clone, Default)]
pub struct PubSubHub {
    subscribers: HotMap<Vec<u8>, HotSet<ClientId>>,
    pending: Vec<(ClientId, CommandReply)>,
}

impl PubSubHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a session to a channel. Returns `true` when this is a
    /// new subscription.
    pub fn subscribe(&mut self, client: ClientId, channel: &[u8]) -> bool {
        self.subscribers
            .entry(channel.to_vec())
            .or_default()
            .insert(client)
    }

    /// Unsubscribes a session from a channel. Returns `true` when the
    /// subscription existed.
    pub fn unsubscribe(&mut self, client: ClientId, channel: &[u8]) -> bool {
        let Some(listeners) = self.subscribers.get_mut(channel) else {
            return false;
        };
        let removed = listeners.remove(&client);
        if listeners.is_empty() {
            let _ = self.subscribers.remove(channel);
        }
        removed
    }

    /// Removes a session from every channel, used on disconnect.
    pub fn detach(&mut self, client: ClientId) {
        self.subscribers.retain(|_, listeners| {
            let _ = listeners.remove(&client);
            !listeners.is_empty()
        });
    }

    /// Stages a message delivery to every subscriber of `channel`.
    /// Returns the number of receivers.
    pub fn publish(&mut self, channel: &[u8], payload: &[u8]) -> usize {
        let Some(listeners) = self.subscribers.get(channel) else {
            return 0;
        };
        for client in listeners {
            self.pending.push((
                *client,
                CommandReply::Array(vec![
                    CommandReply::BulkString(b"message".to_vec()),
                    CommandReply::BulkString(channel.to_vec()),
                    CommandReply::BulkString(payload.to_vec()),
                ]),
            ));
        }
        listeners.len()
    }

    /// Drains staged deliveries for routing into session output queues.
    #[must_use]
    pub fn take_pending(&mut self) -> Vec<(ClientId, CommandReply)> {
        std::mem::take(&mut self.pending)
    }
}
