//! Test doubles shared by the admission and dispatcher test suites.

use ember_common::config::RuntimeConfig;
use ember_common::ids::{DbCount, DbIndex, UnixMillis};

use crate::acl::AccessControl;
use crate::command::CommandFrame;
use crate::dispatch::EngineContext;
use crate::keyspace::{DataStore, MemoryStore, StoreResult};
use crate::observer::ObserverFeed;
use crate::propagation::{DurableLogWriter, ReplicaBroadcaster};
use crate::pubsub::PubSubHub;
use crate::registry::CommandRegistry;
use crate::routing::{RouteDecision, SlotOwnership};
use crate::state::ServerState;

/// Durable-log sink that records appended frames.
#[derive(Debug, Default)]
pub(crate) struct RecordingLog {
    pub disabled: bool,
    pub records: Vec<(DbIndex, CommandFrame)>,
    pub flushes: usize,
}

impl DurableLogWriter for RecordingLog {
    fn enabled(&self) -> bool {
        !self.disabled
    }

    fn append(&mut self, db: DbIndex, frame: &CommandFrame) {
        self.records.push((db, frame.clone()));
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}

/// Replica sink that records fed frames and reports a configurable ack
/// count.
#[derive(Debug, Default)]
pub(crate) struct RecordingFeed {
    pub records: Vec<(DbIndex, CommandFrame)>,
    pub offset: u64,
    pub acked: usize,
}

impl ReplicaBroadcaster for RecordingFeed {
    fn feed(&mut self, db: DbIndex, frame: &CommandFrame) {
        self.offset += frame.payload_len() as u64;
        self.records.push((db, frame.clone()));
    }

    fn current_offset(&self) -> u64 {
        self.offset
    }

    fn acked_replicas(&self, _offset: u64) -> usize {
        self.acked
    }
}

/// Data store that counts every mutating call it receives.
#[derive(Debug)]
pub(crate) struct CountingStore {
    pub inner: MemoryStore,
    pub mutations: usize,
}

impl CountingStore {
    pub(crate) fn new(databases: u16) -> Self {
        Self {
            inner: MemoryStore::new(DbCount::new(databases).expect("non-zero count")),
            mutations: 0,
        }
    }
}

impl DataStore for CountingStore {
    fn get_string(&self, db: DbIndex, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get_string(db, key)
    }

    fn key_exists(&self, db: DbIndex, key: &[u8]) -> bool {
        self.inner.key_exists(db, key)
    }

    fn value_kind(&self, db: DbIndex, key: &[u8]) -> Option<&'static str> {
        self.inner.value_kind(db, key)
    }

    fn list_len(&self, db: DbIndex, key: &[u8]) -> StoreResult<usize> {
        self.inner.list_len(db, key)
    }

    fn expire_time(&self, db: DbIndex, key: &[u8]) -> Option<UnixMillis> {
        self.inner.expire_time(db, key)
    }

    fn key_version(&self, db: DbIndex, key: &[u8]) -> u64 {
        self.inner.key_version(db, key)
    }

    fn key_count(&self, db: DbIndex) -> usize {
        self.inner.key_count(db)
    }

    fn expires_count(&self, db: DbIndex) -> usize {
        self.inner.expires_count(db)
    }

    fn table_capacity(&self, db: DbIndex) -> usize {
        self.inner.table_capacity(db)
    }

    fn memory_used(&self) -> u64 {
        self.inner.memory_used()
    }

    fn random_key(&self, db: DbIndex) -> Option<Vec<u8>> {
        self.inner.random_key(db)
    }

    fn sample_expires(
        &self,
        db: DbIndex,
        offset: usize,
        limit: usize,
    ) -> Vec<(Vec<u8>, UnixMillis)> {
        self.inner.sample_expires(db, offset, limit)
    }

    fn sample_keys(&self, db: DbIndex, limit: usize) -> Vec<Vec<u8>> {
        self.inner.sample_keys(db, limit)
    }

    fn set_string(&mut self, db: DbIndex, key: &[u8], value: Vec<u8>) {
        self.mutations += 1;
        self.inner.set_string(db, key, value);
    }

    fn append_string(&mut self, db: DbIndex, key: &[u8], tail: &[u8]) -> StoreResult<usize> {
        self.mutations += 1;
        self.inner.append_string(db, key, tail)
    }

    fn push_list(
        &mut self,
        db: DbIndex,
        key: &[u8],
        element: Vec<u8>,
        front: bool,
    ) -> StoreResult<usize> {
        self.mutations += 1;
        self.inner.push_list(db, key, element, front)
    }

    fn pop_list_front(&mut self, db: DbIndex, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.mutations += 1;
        self.inner.pop_list_front(db, key)
    }

    fn remove(&mut self, db: DbIndex, key: &[u8]) -> bool {
        self.mutations += 1;
        self.inner.remove(db, key)
    }

    fn set_expire(&mut self, db: DbIndex, key: &[u8], at: UnixMillis) -> bool {
        self.mutations += 1;
        self.inner.set_expire(db, key, at)
    }

    fn clear_expire(&mut self, db: DbIndex, key: &[u8]) -> bool {
        self.mutations += 1;
        self.inner.clear_expire(db, key)
    }

    fn flush_db(&mut self, db: DbIndex) -> usize {
        self.mutations += 1;
        self.inner.flush_db(db)
    }

    fn flush_all(&mut self) -> usize {
        self.mutations += 1;
        self.inner.flush_all()
    }

    fn take_touched_keys(&mut self) -> Vec<(DbIndex, Vec<u8>)> {
        self.inner.take_touched_keys()
    }

    fn needs_resize(&self, db: DbIndex) -> bool {
        self.inner.needs_resize(db)
    }

    fn begin_resize(&mut self, db: DbIndex) {
        self.inner.begin_resize(db);
    }

    fn rehash_step(&mut self, db: DbIndex, max_entries: usize) -> bool {
        self.inner.rehash_step(db, max_entries)
    }

    fn resize_in_progress(&self, db: DbIndex) -> bool {
        self.inner.resize_in_progress(db)
    }
}

/// Routing stub returning one fixed decision.
#[derive(Debug)]
pub(crate) struct StubRouting {
    pub enabled: bool,
    pub decision: RouteDecision,
}

impl Default for StubRouting {
    fn default() -> Self {
        Self {
            enabled: false,
            decision: RouteDecision::Local,
        }
    }
}

impl SlotOwnership for StubRouting {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn route(&self, _keys: &[&[u8]]) -> RouteDecision {
        self.decision.clone()
    }
}

/// Owns one full collaborator set and lends it out as an `EngineContext`.
pub(crate) struct TestEngine {
    pub config: RuntimeConfig,
    pub state: ServerState,
    pub store: CountingStore,
    pub registry: CommandRegistry,
    pub log: RecordingLog,
    pub feed: RecordingFeed,
    pub observers: ObserverFeed,
    pub pubsub: PubSubHub,
    pub acl: AccessControl,
    pub cluster: StubRouting,
}

impl TestEngine {
    pub(crate) fn new() -> Self {
        let mut state = ServerState::new(10);
        state.set_clock(1_000_000);
        // Pin the cached clock so expiration assertions stay
        // deterministic; each call balances its increment back to one.
        state.fixed_time_expire = 1;
        Self {
            config: RuntimeConfig::default(),
            state,
            store: CountingStore::new(16),
            registry: CommandRegistry::with_builtin_commands()
                .expect("builtin command table is valid"),
            log: RecordingLog::default(),
            feed: RecordingFeed::default(),
            observers: ObserverFeed::new(),
            pubsub: PubSubHub::new(),
            acl: AccessControl::open(),
            cluster: StubRouting::default(),
        }
    }

    pub(crate) fn ctx(&mut self) -> EngineContext<'_> {
        EngineContext {
            config: &self.config,
            state: &mut self.state,
            store: &mut self.store,
            registry: &self.registry,
            log: &mut self.log,
            feed: &mut self.feed,
            observers: &mut self.observers,
            pubsub: &mut self.pubsub,
            acl: &self.acl,
            cluster: &self.cluster,
        }
    }
}

/// Builds a frame from byte-slice parts, first part being the name.
pub(crate) fn frame(parts: &[&[u8]]) -> CommandFrame {
    CommandFrame::new(
        String::from_utf8_lossy(parts[0]).into_owned(),
        parts[1..].iter().map(|part| part.to_vec()).collect(),
    )
}
