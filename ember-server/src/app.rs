//! Process composition root.
//!
//! `ServerApp` owns every collaborator of the execution core and drives
//! the per-command pipeline: lookup, admission, transaction queueing or
//! dispatch, then the post-call work (staged pub/sub deliveries, blocked
//! clients whose keys became ready). The cron and the event-loop hooks
//! operate on the same struct from the single dispatch thread.

use std::collections::VecDeque;

use ember_cluster::{ClusterTopology, MigrationSocketCache, SlotRange};
use ember_common::config::RuntimeConfig;
use ember_common::error::{EmberError, EmberResult};
use ember_common::ids::{ClientId, DbIndex, MAX_SLOT_ID};
use ember_core::acl::AccessControl;
use ember_core::admission;
use ember_core::command::{CommandFrame, CommandReply};
use ember_core::containers::HotMap;
use ember_core::dispatch::{call, EngineContext};
use ember_core::flags::{CallFlags, SessionFlags};
use ember_core::keyspace::{DataStore, MemoryStore};
use ember_core::observer::ObserverFeed;
use ember_core::propagation::ReplicaBroadcaster;
use ember_core::pubsub::PubSubHub;
use ember_core::registry::CommandRegistry;
use ember_core::session::{BlockReason, Session};
use ember_core::state::ServerState;
use ember_replication::{DurableLog, LogRecord, ReplicaFeed};

use crate::child::ChildSupervisor;
use crate::cron::CronState;
use crate::resp::{parse_next_command, ParseStatus};
use crate::workers::{IoJob, IoWorkerPool};


/// Idle keep-alive for cached key-migration sockets.
const MIGRATION_SOCKET_KEEPALIVE_MS: u64 = 60_000;

/// The composed server process.
pub struct ServerApp {
    /// Runtime configuration.
    pub config: RuntimeConfig,
    /// Server-wide execution state.
    pub state: ServerState,
    /// The dataset.
    pub store: MemoryStore,
    /// Command table.
    pub registry: CommandRegistry,
    /// Access-control table.
    pub acl: AccessControl,
    /// Durable command log.
    pub log: DurableLog,
    /// Replica stream fan-out.
    pub feed: ReplicaFeed,
    /// Cluster slot ownership.
    pub cluster: ClusterTopology,
    /// Observer mirror feed.
    pub observers: ObserverFeed,
    /// Publish/subscribe hub.
    pub pubsub: PubSubHub,
    /// Connected sessions.
    pub sessions: HotMap<ClientId, Session>,
    /// Rotation order for the connection-maintenance pass.
    pub rotation: VecDeque<ClientId>,
    /// Cron cursors and counters.
    pub cron: CronState,
    /// Background child slot.
    pub children: ChildSupervisor,
    /// Byte-moving worker pool.
    pub workers: IoWorkerPool,
    /// Cached outbound migration sockets.
    pub migration_sockets: MigrationSocketCache,
    /// Serialized reply bytes awaiting the network writer.
    pub encoded_out: Vec<(ClientId, Vec<u8>)>,
    /// Sessions that just left a blocking wait and may have pipelined
    /// input waiting in their buffers.
    unblocked_ready: Vec<ClientId>,
    /// Replica-link sessions and the feed addresses they registered.
    replica_links: HotMap<ClientId, String>,
    next_client_id: ClientId,
}

impl ServerApp {
    /// Builds the process composition.
    ///
    /// # Errors
    ///
    /// Returns `EmberError::InvalidConfig` when the builtin command table
    /// is malformed or a configured rename names an unknown command; both
    /// are fatal startup conditions.
    pub fn new(config: RuntimeConfig) -> EmberResult<Self> {
        let mut registry = CommandRegistry::with_builtin_commands()?;
        registry.apply_renames(&config.renamed_commands)?;

        let cluster = if config.cluster_enabled {
            ClusterTopology::with_owned_ranges(vec![SlotRange {
                start: 0,
                end: MAX_SLOT_ID,
            }])
        } else {
            ClusterTopology::disabled()
        };

        Ok(Self {
            state: ServerState::new(config.config_hz),
            store: MemoryStore::new(config.databases),
            registry,
            acl: AccessControl::open(),
            log: DurableLog::new(config.durable_log_enabled),
            feed: ReplicaFeed::new(),
            cluster,
            observers: ObserverFeed::new(),
            pubsub: PubSubHub::new(),
            sessions: HotMap::new(),
            rotation: VecDeque::new(),
            cron: CronState::default(),
            children: ChildSupervisor::new(),
            workers: IoWorkerPool::new(config.io_threads),
            migration_sockets: MigrationSocketCache::new(MIGRATION_SOCKET_KEEPALIVE_MS),
            encoded_out: Vec::new(),
            unblocked_ready: Vec::new(),
            replica_links: HotMap::new(),
            next_client_id: 1,
            config,
        })
    }

    /// Accepts one logical connection.
    pub fn create_session(&mut self) -> ClientId {
        let client = self.next_client_id;
        self.next_client_id += 1;
        let auth_required = self.acl.auth_required("default");
        let session = Session::new(client, self.state.unix_ms, auth_required);
        let _ = self.sessions.insert(client, session);
        self.rotation.push_back(client);
        client
    }

    /// Read access to one session.
    #[must_use]
    pub fn session(&self, client: ClientId) -> Option<&Session> {
        self.sessions.get(&client)
    }

    /// Mutable access to one session.
    pub fn session_mut(&mut self, client: ClientId) -> Option<&mut Session> {
        self.sessions.get_mut(&client)
    }

    /// Releases one connection and every registry entry that referenced it.
    pub fn disconnect_session(&mut self, client: ClientId) {
        let _ = self.sessions.remove(&client);
        self.state.unblock_from_keys(client);
        self.observers.detach(client);
        self.pubsub.detach(client);
        if let Some(address) = self.replica_links.remove(&client) {
            self.feed.detach(&address);
        }
        // The rotation entry is dropped lazily by the maintenance pass.
    }

    /// Marks a session as a downstream replica link and attaches its
    /// stream endpoint to the feed.
    pub fn attach_replica_link(&mut self, client: ClientId, address: impl Into<String>) {
        let address = address.into();
        if let Some(session) = self.sessions.get_mut(&client) {
            session.flags.insert(SessionFlags::REPLICA_LINK);
        }
        self.feed.attach(address.clone(), self.state.unix_ms);
        let _ = self.replica_links.insert(client, address);
    }

    fn with_engine<R>(
        &mut self,
        client: ClientId,
        run: impl FnOnce(&mut EngineContext<'_>, &mut Session) -> R,
    ) -> Option<R> {
        let Self {
            config,
            state,
            store,
            registry,
            acl,
            log,
            feed,
            cluster,
            observers,
            pubsub,
            sessions,
            ..
        } = self;
        let session = sessions.get_mut(&client)?;
        let mut engine = EngineContext {
            config: &*config,
            state,
            store,
            registry: &*registry,
            log,
            feed,
            observers,
            pubsub,
            acl: &*acl,
            cluster: &*cluster,
        };
        Some(run(&mut engine, session))
    }

    /// Runs one command through the full pipeline, then serves whatever
    /// the command unlocked (staged deliveries, ready keys).
    ///
    /// `None` means the session either vanished or entered a blocking
    /// wait; in the latter case the reply arrives later via
    /// `pending_out`.
    pub fn process_frame(&mut self, client: ClientId, frame: CommandFrame) -> Option<CommandReply> {
        let reply = self.dispatch_frame(client, frame);
        self.deliver_pubsub_pending();
        self.serve_ready_keys();
        reply
    }

    fn dispatch_frame(&mut self, client: ClientId, frame: CommandFrame) -> Option<CommandReply> {
        if frame.name == "QUIT" {
            let session = self.sessions.get_mut(&client)?;
            session.flags.insert(SessionFlags::CLOSE_AFTER_REPLY);
            return Some(CommandReply::ok());
        }

        self.with_engine(client, |engine, session| {
            session.touch(engine.state.unix_ms);

            let registry = engine.registry;
            let Some(spec) = registry.lookup(&frame.name) else {
                session.tx.mark_aborted();
                return Some(admission::unknown_command_rejection(&frame.name).into_reply());
            };
            if let Some(rejection) = admission::arity_rejection(spec, &frame) {
                session.tx.mark_aborted();
                return Some(rejection.into_reply());
            }
            if let Err(rejection) = admission::admit(engine, session, spec, &frame) {
                // A rejected commit aborts outright; any other rejection
                // only dooms the open transaction.
                if spec.name == "EXEC" {
                    let _ = session.tx.discard();
                    session.unwatch();
                } else {
                    session.tx.mark_aborted();
                }
                return Some(rejection.into_reply());
            }

            if session.tx.is_open()
                && !matches!(spec.name, "EXEC" | "DISCARD" | "MULTI" | "WATCH")
            {
                session.tx.queue(frame.clone());
                return Some(CommandReply::SimpleString("QUEUED".to_owned()));
            }

            call(engine, session, spec, &frame, CallFlags::FULL, None).reply
        })
        .flatten()
    }

    fn deliver_pubsub_pending(&mut self) {
        for (client, reply) in self.pubsub.take_pending() {
            if let Some(session) = self.sessions.get_mut(&client) {
                session.pending_out.push(reply);
            }
        }
    }

    /// Serves blocked sessions whose awaited keys became ready. Each
    /// resumed command re-enters the pipeline from the top, admission
    /// included.
    pub fn serve_ready_keys(&mut self) {
        while !self.state.ready_keys.is_empty() {
            let ready = std::mem::take(&mut self.state.ready_keys);
            for (db, key) in ready {
                self.serve_one_ready_key(db, key);
            }
        }
    }

    fn serve_one_ready_key(&mut self, db: DbIndex, key: Vec<u8>) {
        loop {
            let next_waiter = match self.state.blocked_on_keys.get_mut(&(db, key.clone())) {
                Some(waiters) if !waiters.is_empty() => Some(waiters.remove(0)),
                _ => None,
            };
            let Some(client) = next_waiter else {
                break;
            };
            let Some(retry) = self
                .sessions
                .get(&client)
                .and_then(|session| session.blocked.as_ref())
                .map(|blocked| blocked.retry.clone())
            else {
                continue;
            };

            self.unblock_session(client);
            match self.dispatch_frame(client, retry) {
                Some(reply) => {
                    if let Some(session) = self.sessions.get_mut(&client) {
                        session.pending_out.push(reply);
                    }
                }
                // The retry blocked again: the key ran dry.
                None => break,
            }
        }

        let entry = (db, key);
        if self
            .state
            .blocked_on_keys
            .get(&entry)
            .is_some_and(Vec::is_empty)
        {
            let _ = self.state.blocked_on_keys.remove(&entry);
        }
    }

    fn unblock_session(&mut self, client: ClientId) {
        self.state.unblock_from_keys(client);
        if let Some(session) = self.sessions.get_mut(&client) {
            session.blocked = None;
        }
        if !self.unblocked_ready.contains(&client) {
            self.unblocked_ready.push(client);
        }
    }

    /// Runs commands a session pipelined behind a blocking wait. While
    /// blocked the session consumed no dispatch cycles; its buffered input
    /// resumes here, from the top of the pipeline.
    pub fn process_unblocked_sessions(&mut self) {
        let clients = std::mem::take(&mut self.unblocked_ready);
        for client in clients {
            loop {
                let parsed = match self.sessions.get(&client) {
                    Some(session) if !session.is_blocked() => {
                        parse_next_command(&session.query_buffer)
                    }
                    _ => break,
                };
                let Ok(ParseStatus::Complete { frame, consumed }) = parsed else {
                    break;
                };
                if let Some(session) = self.sessions.get_mut(&client) {
                    let _ = session.query_buffer.drain(..consumed);
                }
                match self.process_frame(client, frame) {
                    Some(reply) => {
                        if let Some(session) = self.sessions.get_mut(&client) {
                            session.pending_out.push(reply);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    /// Resolves every blocked session whose deadline has passed with its
    /// timeout-specific reply. A timeout is a normal outcome, not a fault.
    pub fn unblock_timed_out(&mut self) {
        let now = self.state.unix_ms;
        let expired: Vec<ClientId> = self
            .sessions
            .values()
            .filter(|session| {
                session
                    .blocked
                    .as_ref()
                    .and_then(|blocked| blocked.deadline)
                    .is_some_and(|deadline| deadline <= now)
            })
            .map(|session| session.id)
            .collect();
        for client in expired {
            self.finish_blocked_wait_with_timeout(client);
        }
    }

    /// Unblocks one session with the timeout reply of its wait kind.
    pub(crate) fn finish_blocked_wait_with_timeout(&mut self, client: ClientId) {
        let reply = {
            let Some(session) = self.sessions.get(&client) else {
                return;
            };
            let Some(blocked) = session.blocked.as_ref() else {
                return;
            };
            match &blocked.reason {
                BlockReason::Keys { .. } => CommandReply::NullArray,
                BlockReason::ReplicaAcks { target_offset, .. } => {
                    CommandReply::Integer(self.feed.acked_replicas(*target_offset) as i64)
                }
            }
        };
        self.unblock_session(client);
        if let Some(session) = self.sessions.get_mut(&client) {
            session.pending_out.push(reply);
        }
    }

    /// Unblocks sessions waiting on replica acknowledgements once enough
    /// replicas acked their target offset.
    pub fn serve_ack_waiters(&mut self) {
        let satisfied: Vec<(ClientId, i64)> = self
            .sessions
            .values()
            .filter_map(|session| {
                let blocked = session.blocked.as_ref()?;
                let BlockReason::ReplicaAcks {
                    target_offset,
                    required,
                } = &blocked.reason
                else {
                    return None;
                };
                let acked = self.feed.acked_replicas(*target_offset);
                if acked >= *required {
                    Some((session.id, acked as i64))
                } else {
                    None
                }
            })
            .collect();

        for (client, acked) in satisfied {
            self.unblock_session(client);
            if let Some(session) = self.sessions.get_mut(&client) {
                session.pending_out.push(CommandReply::Integer(acked));
            }
        }
    }

    /// Pushes invalidation notifications to tracking sessions whose
    /// remembered keys were modified since the previous broadcast.
    pub fn broadcast_invalidations(&mut self) {
        let touched = self.store.take_touched_keys();
        if touched.is_empty() {
            return;
        }
        for session in self.sessions.values_mut() {
            if !session.flags.contains(SessionFlags::TRACKING) {
                continue;
            }
            for (_db, key) in &touched {
                if session.tracked_keys.remove(key.as_slice()) {
                    session.pending_out.push(CommandReply::Array(vec![
                        CommandReply::BulkString(b"invalidate".to_vec()),
                        CommandReply::Array(vec![CommandReply::BulkString(key.clone())]),
                    ]));
                }
            }
        }
    }

    /// Hands queued replies to the serialization workers (or serializes
    /// inline while the pool is suspended).
    pub fn flush_pending_replies(&mut self) {
        let mut pending = Vec::new();
        for session in self.sessions.values_mut() {
            if session.pending_out.is_empty() {
                continue;
            }
            pending.push((session.id, std::mem::take(&mut session.pending_out)));
        }

        self.workers.adjust_for_load(pending.len());
        for (client, replies) in pending {
            if self.workers.is_active() {
                let _ = self.workers.submit(IoJob::EncodeReplies { client, replies });
            } else {
                let mut bytes = Vec::new();
                for reply in &replies {
                    bytes.extend_from_slice(&reply.to_resp_bytes());
                }
                self.encoded_out.push((client, bytes));
            }
        }
    }

    /// Collects finished worker buffers into the outgoing queue.
    pub fn drain_worker_output(&mut self) {
        for result in self.workers.drain_results() {
            self.encoded_out.push((result.client, result.bytes));
        }
    }

    /// Takes every serialized buffer awaiting the network writer.
    #[must_use]
    pub fn take_encoded_output(&mut self) -> Vec<(ClientId, Vec<u8>)> {
        std::mem::take(&mut self.encoded_out)
    }

    /// Releases sessions marked close-after-reply whose output drained.
    /// Returns the released ids so the network layer can close sockets.
    pub fn free_closing_sessions(&mut self) -> Vec<ClientId> {
        let closing: Vec<ClientId> = self
            .sessions
            .values()
            .filter(|session| {
                session.flags.contains(SessionFlags::CLOSE_AFTER_REPLY)
                    && session.pending_out.is_empty()
            })
            .map(|session| session.id)
            .collect();
        for client in &closing {
            self.disconnect_session(*client);
        }
        closing
    }

    /// Feeds raw socket bytes into one connection: buffers, parses,
    /// executes complete frames and returns the serialized replies.
    ///
    /// # Errors
    ///
    /// Returns `EmberError::Protocol` on malformed framing (the caller
    /// drops the connection) and `EmberError::InvalidState` for unknown
    /// connections.
    pub fn ingest_bytes(&mut self, client: ClientId, bytes: &[u8]) -> EmberResult<Vec<u8>> {
        self.state.stat_net_input_bytes += bytes.len() as u64;
        let now = self.state.unix_ms;
        {
            let session = self
                .sessions
                .get_mut(&client)
                .ok_or(EmberError::InvalidState("unknown connection"))?;
            session.query_buffer.extend_from_slice(bytes);
            session.touch(now);
        }

        let mut out = Vec::new();
        loop {
            let parsed = {
                let session = self
                    .sessions
                    .get(&client)
                    .ok_or(EmberError::InvalidState("unknown connection"))?;
                parse_next_command(&session.query_buffer)?
            };
            let ParseStatus::Complete { frame, consumed } = parsed else {
                break;
            };
            if let Some(session) = self.sessions.get_mut(&client) {
                let _ = session.query_buffer.drain(..consumed);
            }
            match self.process_frame(client, frame) {
                Some(reply) => out.extend_from_slice(&reply.to_resp_bytes()),
                None => {
                    // A blocked session consumes no further dispatch
                    // cycles; whatever it pipelined stays buffered until
                    // the wait resolves.
                    let suspended = self
                        .sessions
                        .get(&client)
                        .is_some_and(|session| session.is_blocked());
                    if suspended {
                        break;
                    }
                }
            }
            let closing = self
                .sessions
                .get(&client)
                .map_or(true, |session| {
                    session.flags.contains(SessionFlags::CLOSE_AFTER_REPLY)
                });
            if closing {
                break;
            }
        }

        if let Some(session) = self.sessions.get_mut(&client) {
            for reply in session.pending_out.drain(..) {
                out.extend_from_slice(&reply.to_resp_bytes());
            }
        }
        for line in self.observers.drain(client) {
            out.push(b'+');
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        self.state.stat_net_output_bytes += out.len() as u64;
        Ok(out)
    }

    /// Replays durable-log records into the dataset, with introspection
    /// and propagation suppressed for the duration of the load.
    pub fn replay_log_records(&mut self, records: &[LogRecord]) -> usize {
        self.state.loading = true;
        let mut replayer = Session::new(0, self.state.unix_ms, false);
        replayer.flags.insert(SessionFlags::PRIMARY_LINK);

        let mut replayed = 0;
        for record in records {
            if self.apply_trusted_frame(&mut replayer, record.db, &record.frame, CallFlags::NONE) {
                replayed += 1;
            }
        }
        self.state.loading = false;
        replayed
    }

    /// Applies records arriving over the upstream link on a replica.
    /// The effects re-propagate so this node's own log and any attached
    /// sub-replicas stay consistent.
    pub fn apply_replica_stream(&mut self, records: &[LogRecord]) -> usize {
        let mut upstream = Session::new(0, self.state.unix_ms, false);
        upstream.flags.insert(SessionFlags::PRIMARY_LINK);

        let mut applied = 0;
        for record in records {
            if self.apply_trusted_frame(&mut upstream, record.db, &record.frame, CallFlags::FULL) {
                applied += 1;
            }
        }
        applied
    }

    /// Runs one trusted (already-admitted upstream) record through the
    /// queue-or-call pipeline so envelope markers replay atomically.
    /// Resolution goes through the original table: operator renames never
    /// break replay.
    fn apply_trusted_frame(
        &mut self,
        session: &mut Session,
        db: DbIndex,
        frame: &CommandFrame,
        call_flags: CallFlags,
    ) -> bool {
        session.db = db;
        let Self {
            config,
            state,
            store,
            registry,
            acl,
            log,
            feed,
            cluster,
            observers,
            pubsub,
            ..
        } = self;
        let Some(spec) = registry.lookup_original(&frame.name) else {
            tracing::warn!(command = %frame.name, "skipping unknown record during apply");
            return false;
        };

        if session.tx.is_open() && !matches!(spec.name, "EXEC" | "DISCARD" | "MULTI" | "WATCH") {
            session.tx.queue(frame.clone());
            return true;
        }

        let mut engine = EngineContext {
            config: &*config,
            state,
            store,
            registry: &*registry,
            log,
            feed,
            observers,
            pubsub,
            acl: &*acl,
            cluster: &*cluster,
        };
        let _ = call(&mut engine, session, spec, frame, call_flags, None);
        true
    }

    /// Estimated serialization backlog, used for worker-pool sizing.
    #[must_use]
    pub fn pending_reply_volume(&self) -> usize {
        self.sessions
            .values()
            .map(|session| session.pending_out.len())
            .sum()
    }
}
