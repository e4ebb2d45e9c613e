//! Per-connection session state.
//!
//! One [`Session`] lives from connection accept to disconnect. Command
//! execution mutates it continuously: the selected keyspace, transaction
//! queueing, optimistic watches, blocking waits and the cron accounting
//! fields all hang off this struct so the execution core never needs to
//! reach into the network layer.

use ember_common::ids::{ClientId, DbIndex, UnixMillis};

use crate::command::{CommandFrame, CommandReply};
use crate::containers::HotSet;
use crate::flags::SessionFlags;

/// One optimistic-watch descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedKey {
    /// Logical keyspace index.
    pub db: DbIndex,
    /// Watched key bytes.
    pub key: Vec<u8>,
    /// Key version captured at watch time.
    pub version: u64,
}

/// What a blocked session is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// One of the listed keys becoming ready.
    Keys {
        /// Awaited keys, in the order the client listed them.
        keys: Vec<(DbIndex, Vec<u8>)>,
    },
    /// Replica acknowledgements reaching an offset.
    ReplicaAcks {
        /// Primary stream offset the acknowledgements must reach.
        target_offset: u64,
        /// Number of acknowledging replicas required.
        required: usize,
    },
}

/// Suspension state of a blocked session.
///
/// The original frame is retained because resumption re-enters the
/// admission pipeline from the top, exactly as if the command had just
/// arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedState {
    /// The awaited condition.
    pub reason: BlockReason,
    /// Absolute deadline; `None` blocks forever.
    pub deadline: Option<UnixMillis>,
    /// Frame to re-dispatch when the condition is signalled.
    pub retry: CommandFrame,
}

/// Connection-scoped transaction queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionState {
    open: bool,
    aborted: bool,
    queued: Vec<CommandFrame>,
}

impl TransactionState {
    /// Opens the queue. Returns `false` when a transaction is already open.
    #[must_use]
    pub fn begin(&mut self) -> bool {
        if self.open {
            return false;
        }
        self.open = true;
        self.aborted = false;
        self.queued.clear();
        true
    }

    /// Queues one command for the eventual commit.
    pub fn queue(&mut self, frame: CommandFrame) {
        if self.open {
            self.queued.push(frame);
        }
    }

    /// Drops the queue and exits transaction mode. Returns `false` when no
    /// transaction was open.
    #[must_use]
    pub fn discard(&mut self) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        self.aborted = false;
        self.queued.clear();
        true
    }

    /// Exits transaction mode and hands the queue to the commit path.
    pub fn take_for_commit(&mut self) -> Option<Vec<CommandFrame>> {
        if !self.open {
            return None;
        }
        self.open = false;
        self.aborted = false;
        Some(std::mem::take(&mut self.queued))
    }

    /// Marks the open transaction as doomed: the eventual commit aborts.
    pub fn mark_aborted(&mut self) {
        if self.open {
            self.aborted = true;
        }
    }

    /// Whether a transaction queue is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Whether a queue-time error doomed the open transaction.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Read access to the queued commands, used by admission to aggregate
    /// the effective flags of a pending commit.
    #[must_use]
    pub fn queued(&self) -> &[CommandFrame] {
        &self.queued
    }
}

/// Memory-accounting bucket a session belongs to.
pub const SESSION_CATEGORY_NORMAL: usize = 0;
/// Replica-link bucket.
pub const SESSION_CATEGORY_REPLICA: usize = 1;
/// Subscriber-mode bucket.
pub const SESSION_CATEGORY_PUBSUB: usize = 2;
/// Number of accounting buckets.
pub const SESSION_CATEGORY_COUNT: usize = 3;

/// Mutable state attached to one client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Stable connection identifier.
    pub id: ClientId,
    /// Selected keyspace.
    pub db: DbIndex,
    /// Session flags.
    pub flags: SessionFlags,
    /// Whether the session passed authentication (or none is required).
    pub authenticated: bool,
    /// Authenticated identity name.
    pub user: String,
    /// Transaction queue.
    pub tx: TransactionState,
    /// Optimistic watch descriptors.
    pub watched: Vec<WatchedKey>,
    /// Blocking-wait state, when suspended.
    pub blocked: Option<BlockedState>,
    /// Cached timestamp of the last command or byte received.
    pub last_interaction: UnixMillis,
    /// Unparsed ingress bytes.
    pub query_buffer: Vec<u8>,
    /// Largest query-buffer fill observed since the last cron visit.
    pub query_buffer_peak: usize,
    /// Replies produced outside the request/response rhythm: unblock
    /// results, subscription deliveries, invalidation pushes.
    pub pending_out: Vec<CommandReply>,
    /// Subscribed channels.
    pub subscriptions: HotSet<Vec<u8>>,
    /// Keys read while tracking was enabled, pending invalidation interest.
    pub tracked_keys: HotSet<Vec<u8>>,
    /// Memory usage this session last contributed to the category totals.
    pub cron_memory_usage: usize,
    /// Bucket the last contribution was accounted under.
    pub cron_memory_category: usize,
}

impl Session {
    /// Creates the state for a freshly accepted connection.
    #[must_use]
    pub fn new(id: ClientId, now: UnixMillis, auth_required: bool) -> Self {
        Self {
            id,
            db: 0,
            flags: SessionFlags::NONE,
            authenticated: !auth_required,
            user: "default".to_owned(),
            tx: TransactionState::default(),
            watched: Vec::new(),
            blocked: None,
            last_interaction: now,
            query_buffer: Vec::new(),
            query_buffer_peak: 0,
            pending_out: Vec::new(),
            subscriptions: HotSet::new(),
            tracked_keys: HotSet::new(),
            cron_memory_usage: 0,
            cron_memory_category: SESSION_CATEGORY_NORMAL,
        }
    }

    /// Adds or refreshes one watch descriptor.
    pub fn watch_key(&mut self, db: DbIndex, key: Vec<u8>, version: u64) {
        if let Some(existing) = self
            .watched
            .iter_mut()
            .find(|entry| entry.db == db && entry.key == key)
        {
            existing.version = version;
            return;
        }
        self.watched.push(WatchedKey { db, key, version });
    }

    /// Clears every watch descriptor.
    pub fn unwatch(&mut self) {
        self.watched.clear();
    }

    /// Returns whether all watched keys still match their captured versions.
    #[must_use]
    pub fn watched_keys_clean<F>(&self, mut current_version: F) -> bool
    where
        F: FnMut(DbIndex, &[u8]) -> u64,
    {
        self.watched
            .iter()
            .all(|entry| current_version(entry.db, &entry.key) == entry.version)
    }

    /// Whether the session is suspended in a blocking wait.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// Records activity for the idle-timeout sweep.
    pub fn touch(&mut self, now: UnixMillis) {
        self.last_interaction = now;
        if self.query_buffer.len() > self.query_buffer_peak {
            self.query_buffer_peak = self.query_buffer.len();
        }
    }

    /// Estimated memory footprint, consumed by the connection-maintenance
    /// cron pass.
    #[must_use]
    pub fn estimated_memory(&self) -> usize {
        self.query_buffer.capacity()
            + self.pending_out.len() * 64
            + self.subscriptions.iter().map(Vec::len).sum::<usize>()
            + self.tracked_keys.iter().map(Vec::len).sum::<usize>()
            + std::mem::size_of::<Self>()
    }

    /// Accounting bucket derived from the session flags.
    #[must_use]
    pub fn memory_category(&self) -> usize {
        if self.flags.contains(SessionFlags::REPLICA_LINK) {
            SESSION_CATEGORY_REPLICA
        } else if self.flags.contains(SessionFlags::PUBSUB_MODE) {
            SESSION_CATEGORY_PUBSUB
        } else {
            SESSION_CATEGORY_NORMAL
        }
    }
}
