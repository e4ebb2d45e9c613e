//! Replica stream fan-out and acknowledgement bookkeeping.
//!
//! Every propagated record is appended to each attached peer's stream
//! buffer and advances the primary offset. Peers acknowledge offsets out
//! of band; the acknowledgements feed the good-replica count consumed by
//! the write-quorum admission gate and the `WAIT` unblocking logic.

use ember_common::ids::{DbIndex, UnixMillis};
use ember_core::command::CommandFrame;
use ember_core::propagation::ReplicaBroadcaster;

use crate::log::LogRecord;

/// One attached replica connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaPeer {
    /// Peer address, also its identity within the feed.
    pub address: String,
    /// Records fed but not yet drained towards the peer's socket.
    pub stream: Vec<LogRecord>,
    /// Highest offset the peer acknowledged.
    pub acked_offset: u64,
    /// Cached clock value of the latest acknowledgement.
    pub last_ack_at: UnixMillis,
}

/// Fan-out state for all attached replicas.
#[derive(Debug, Clone, Default)]
pub struct ReplicaFeed {
    peers: Vec<ReplicaPeer>,
    offset: u64,
}

impl ReplicaFeed {
    /// Creates a feed with no attached replicas.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a replica connection. Re-attaching an address resets its
    /// stream state.
    pub fn attach(&mut self, address: impl Into<String>, now: UnixMillis) {
        let address = address.into();
        self.detach(&address);
        self.peers.push(ReplicaPeer {
            address,
            stream: Vec::new(),
            acked_offset: 0,
            last_ack_at: now,
        });
    }

    /// Detaches a replica connection.
    pub fn detach(&mut self, address: &str) {
        self.peers.retain(|peer| peer.address != address);
    }

    /// Number of attached replicas.
    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.peers.len()
    }

    /// Records an acknowledgement from one peer.
    pub fn record_ack(&mut self, address: &str, offset: u64, now: UnixMillis) {
        if let Some(peer) = self
            .peers
            .iter_mut()
            .find(|peer| peer.address == address)
        {
            if offset > peer.acked_offset {
                peer.acked_offset = offset;
            }
            peer.last_ack_at = now;
        }
    }

    /// Replicas whose latest acknowledgement is within the lag bound.
    #[must_use]
    pub fn good_replicas(&self, now: UnixMillis, max_lag_secs: u64) -> usize {
        let max_lag_ms = max_lag_secs.saturating_mul(1000);
        self.peers
            .iter()
            .filter(|peer| now.saturating_sub(peer.last_ack_at) <= max_lag_ms)
            .count()
    }

    /// Drains the pending stream for one peer, as its connection writer
    /// would.
    #[must_use]
    pub fn drain_stream(&mut self, address: &str) -> Vec<LogRecord> {
        self.peers
            .iter_mut()
            .find(|peer| peer.address == address)
            .map(|peer| std::mem::take(&mut peer.stream))
            .unwrap_or_default()
    }

    /// Sends a keepalive record down every stream, advancing the offset so
    /// lag is measurable even on idle primaries.
    pub fn ping_replicas(&mut self) {
        let ping = CommandFrame::new("PING", Vec::new());
        self.feed(0, &ping);
    }

    /// Requests an acknowledgement round-trip from every replica.
    pub fn request_acks(&mut self) {
        let getack = CommandFrame::new(
            "REPLCONF",
            vec![b"GETACK".to_vec(), b"*".to_vec()],
        );
        self.feed(0, &getack);
    }
}

impl ReplicaBroadcaster for ReplicaFeed {
    fn feed(&mut self, db: DbIndex, frame: &CommandFrame) {
        self.offset += frame.payload_len() as u64 + 8;
        for peer in &mut self.peers {
            peer.stream.push(LogRecord {
                db,
                frame: frame.clone(),
            });
        }
    }

    fn current_offset(&self) -> u64 {
        self.offset
    }

    fn acked_replicas(&self, offset: u64) -> usize {
        self.peers
            .iter()
            .filter(|peer| peer.acked_offset >= offset)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::ReplicaFeed;
    use ember_core::command::CommandFrame;
    use ember_core::propagation::ReplicaBroadcaster;
    use googletest::prelude::*;
    use rstest::rstest;

    fn write_frame() -> CommandFrame {
        CommandFrame::new("SET", vec![b"k".to_vec(), b"v".to_vec()])
    }

    #[rstest]
    fn feed_reaches_every_attached_peer_in_order() {
        let mut feed = ReplicaFeed::new();
        feed.attach("10.0.0.1:6380", 0);
        feed.attach("10.0.0.2:6380", 0);

        feed.feed(0, &write_frame());
        feed.feed(1, &CommandFrame::new("DEL", vec![b"k".to_vec()]));

        let first = feed.drain_stream("10.0.0.1:6380");
        assert_that!(first.len(), eq(2_usize));
        assert_that!(first[0].frame.name.as_str(), eq("SET"));
        assert_that!(first[1].db, eq(1_u16));
        assert_that!(feed.drain_stream("10.0.0.2:6380").len(), eq(2_usize));
        // Draining consumes the backlog.
        assert_that!(feed.drain_stream("10.0.0.1:6380").is_empty(), eq(true));
    }

    #[rstest]
    fn acknowledgements_gate_the_acked_replica_count() {
        let mut feed = ReplicaFeed::new();
        feed.attach("a", 0);
        feed.attach("b", 0);
        feed.feed(0, &write_frame());
        let offset = feed.current_offset();
        assert_that!(feed.acked_replicas(offset), eq(0_usize));

        feed.record_ack("a", offset, 50);
        assert_that!(feed.acked_replicas(offset), eq(1_usize));
        feed.record_ack("b", offset / 2, 50);
        assert_that!(feed.acked_replicas(offset), eq(1_usize));
    }

    #[rstest]
    fn good_replica_count_follows_the_lag_bound() {
        let mut feed = ReplicaFeed::new();
        feed.attach("a", 0);
        feed.attach("b", 0);
        feed.record_ack("a", 1, 90_000);
        feed.record_ack("b", 1, 5_000);

        assert_that!(feed.good_replicas(100_000, 10), eq(1_usize));
        assert_that!(feed.good_replicas(100_000, 120), eq(2_usize));
    }

    #[rstest]
    fn reattaching_a_peer_resets_its_stream() {
        let mut feed = ReplicaFeed::new();
        feed.attach("a", 0);
        feed.feed(0, &write_frame());
        feed.attach("a", 10);

        assert_that!(feed.replica_count(), eq(1_usize));
        assert_that!(feed.drain_stream("a").is_empty(), eq(true));
    }

    #[rstest]
    fn keepalives_advance_the_primary_offset() {
        let mut feed = ReplicaFeed::new();
        feed.attach("a", 0);
        let before = feed.current_offset();
        feed.ping_replicas();
        assert_that!(feed.current_offset() > before, eq(true));
        let stream = feed.drain_stream("a");
        assert_that!(stream[0].frame.name.as_str(), eq("PING"));
    }
}
