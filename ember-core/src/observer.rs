//! Passive observer (monitor) mirroring.
//!
//! Observer output queues live outside the session table on purpose: the
//! dispatcher mirrors a command while the issuing session is mutably
//! borrowed, so observer state must be reachable through the engine
//! context instead.

use ember_common::ids::{ClientId, DbIndex, UnixMillis};

use crate::command::CommandFrame;
use crate::containers::HotMap;

/// Mirror feed for observer connections.
#[derive(Debug, Clone, Default)]
pub struct ObserverFeed {
    outputs: HotMap<ClientId, Vec<String>>,
}

impl ObserverFeed {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer connection.
    pub fn attach(&mut self, client: ClientId) {
        let _ = self.outputs.entry(client).or_default();
    }

    /// Removes an observer connection and its queued lines.
    pub fn detach(&mut self, client: ClientId) {
        let _ = self.outputs.remove(&client);
    }

    /// Whether any observer is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Mirrors one invocation to every attached observer.
    pub fn mirror(&mut self, now: UnixMillis, db: DbIndex, frame: &CommandFrame) {
        if self.outputs.is_empty() {
            return;
        }
        let mut line = format!("{}.{:03} [{db}] {}", now / 1000, now % 1000, frame.name);
        for arg in &frame.args {
            line.push(' ');
            line.push('"');
            line.push_str(&String::from_utf8_lossy(arg));
            line.push('"');
        }
        for queue in self.outputs.values_mut() {
            queue.push(line.clone());
        }
    }

    /// Drains the queued mirror lines for one observer.
    #[must_use]
    pub fn drain(&mut self, client: ClientId) -> Vec<String> {
        self.outputs
            .get_mut(&client)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::ObserverFeed;
    use crate::command::CommandFrame;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn mirror_reaches_every_attached_observer() {
        let mut feed = ObserverFeed::new();
        feed.attach(1);
        feed.attach(2);
        feed.mirror(12_345, 0, &CommandFrame::new("SET", vec![b"k".to_vec(), b"v".to_vec()]));

        let first = feed.drain(1);
        let second = feed.drain(2);
        assert_that!(first.len(), eq(1_usize));
        assert_that!(&first, eq(&second));
        assert_that!(first[0].contains("SET \"k\" \"v\""), eq(true));
    }

    #[rstest]
    fn drain_empties_the_queue() {
        let mut feed = ObserverFeed::new();
        feed.attach(1);
        feed.mirror(0, 0, &CommandFrame::new("PING", Vec::new()));

        assert_that!(feed.drain(1).len(), eq(1_usize));
        assert_that!(feed.drain(1).is_empty(), eq(true));
    }

    #[rstest]
    fn detached_observer_receives_nothing() {
        let mut feed = ObserverFeed::new();
        feed.attach(1);
        feed.detach(1);
        feed.mirror(0, 0, &CommandFrame::new("PING", Vec::new()));
        assert_that!(feed.is_empty(), eq(true));
        assert_that!(feed.drain(1).is_empty(), eq(true));
    }
}
