//! Admission and safety gates.
//!
//! Every command passes this chain before its handler may run. The gates
//! are evaluated in a fixed order and short-circuit on the first failure;
//! each failure carries a distinct category token so clients and operators
//! can branch on it. No gate mutates the dataset; the only side effects
//! are the eviction attempt of the memory gate and the audit trail of the
//! access-control gate.

use crate::acl::Permission;
use crate::command::{CommandFrame, CommandReply};
use crate::dispatch::EngineContext;
use crate::flags::{CommandFlags, SessionFlags};
use crate::maxmemory;
use crate::registry::CommandSpec;
use crate::routing::RouteDecision;
use crate::session::Session;
use crate::state::{AclAuditEntry, LinkState, NodeRole, PersistStatus};

/// Which policy rejected the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// No such command in the live table.
    UnknownCommand,
    /// Argument count violates the arity contract.
    WrongArity,
    /// Session is not authenticated.
    NoAuth,
    /// Identity may not run this command.
    AclCommand,
    /// Identity may not touch one of the key arguments.
    AclKey,
    /// Keys belong to another node; the reply is a redirection.
    ClusterRedirect,
    /// Memory ceiling exceeded and reclamation failed.
    OutOfMemory,
    /// Snapshot persistence is failing and writes are suspended.
    PersistenceSnapshot,
    /// Durable-log persistence is failing and writes are suspended.
    PersistenceLog,
    /// Not enough replicas within acceptable lag.
    NoGoodReplicas,
    /// This replica is configured read-only.
    ReadOnlyReplica,
    /// Command not allowed in the reduced subscribe/publish mode.
    PubSubContext,
    /// Replica data is stale and the policy forbids serving it.
    StaleReplica,
    /// A bulk dataset load is in progress.
    Loading,
    /// A server-side script exceeded its time budget.
    BusyScript,
}

/// One admission failure: the policy that fired plus the exact reply text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Policy category.
    pub kind: RejectKind,
    /// Deterministic reply message, category token first.
    pub message: String,
}

impl Rejection {
    fn new(kind: RejectKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Converts the rejection into its error reply.
    #[must_use]
    pub fn into_reply(self) -> CommandReply {
        CommandReply::Error(self.message)
    }
}

/// Gate 1a: the command does not exist.
#[must_use]
pub fn unknown_command_rejection(name: &str) -> Rejection {
    Rejection::new(
        RejectKind::UnknownCommand,
        format!("ERR unknown command '{name}'"),
    )
}

/// Gate 1b: argument count against the arity contract.
#[must_use]
pub fn arity_rejection(spec: &CommandSpec, frame: &CommandFrame) -> Option<Rejection> {
    if spec.arity_matches(frame.args.len()) {
        return None;
    }
    Some(Rejection::new(
        RejectKind::WrongArity,
        format!(
            "ERR wrong number of arguments for '{}' command",
            spec.name.to_ascii_lowercase()
        ),
    ))
}

/// Flags a pending commit inherits from its queued commands: a commit is a
/// write if any queued command writes, and only tolerates stale or loading
/// state when every queued command does.
struct EffectiveFlags {
    write: bool,
    use_memory: bool,
    stale_ok: bool,
    loading_ok: bool,
}

fn effective_flags(
    engine: &EngineContext<'_>,
    session: &Session,
    spec: &CommandSpec,
) -> EffectiveFlags {
    let mut effective = EffectiveFlags {
        write: spec.flags.contains(CommandFlags::WRITE),
        use_memory: spec.flags.contains(CommandFlags::USE_MEMORY),
        stale_ok: spec.flags.contains(CommandFlags::STALE_OK),
        loading_ok: spec.flags.contains(CommandFlags::LOADING_OK),
    };
    if spec.name != "EXEC" {
        return effective;
    }

    for queued in session.tx.queued() {
        let Some(queued_spec) = engine.registry.lookup(&queued.name) else {
            continue;
        };
        effective.write |= queued_spec.flags.contains(CommandFlags::WRITE);
        effective.use_memory |= queued_spec.flags.contains(CommandFlags::USE_MEMORY);
        effective.stale_ok &= queued_spec.flags.contains(CommandFlags::STALE_OK);
        effective.loading_ok &= queued_spec.flags.contains(CommandFlags::LOADING_OK);
    }
    effective
}

/// Gates 2–12, in order, first failure wins.
///
/// # Errors
///
/// Returns the [`Rejection`] of the first failing gate. The caller is
/// responsible for marking an open transaction dirty (or aborting it when
/// the rejected command is the commit itself).
pub fn admit(
    engine: &mut EngineContext<'_>,
    session: &Session,
    spec: &CommandSpec,
    frame: &CommandFrame,
) -> Result<(), Rejection> {
    let config = engine.config;
    let registry = engine.registry;
    let effective = effective_flags(engine, session, spec);

    // Gate 2: authentication.
    if !session.authenticated && !spec.flags.contains(CommandFlags::NO_AUTH) {
        return Err(Rejection::new(
            RejectKind::NoAuth,
            "NOAUTH Authentication required.",
        ));
    }

    // Gate 3: access control, command level then key level.
    let keys = spec.key_args(frame);
    match engine.acl.check_permission(&session.user, spec.name, &keys) {
        Permission::Allowed => {}
        Permission::DeniedCommand => {
            audit_denial(engine, session, spec, false);
            return Err(Rejection::new(
                RejectKind::AclCommand,
                format!(
                    "NOPERM this user has no permissions to run the '{}' command",
                    spec.name.to_ascii_lowercase()
                ),
            ));
        }
        Permission::DeniedKey => {
            audit_denial(engine, session, spec, true);
            return Err(Rejection::new(
                RejectKind::AclKey,
                "NOPERM this user has no permissions to access one of the keys used as arguments",
            ));
        }
    }

    // Gate 4: cluster slot ownership. Internal links bypass routing.
    if engine.cluster.enabled()
        && !session
            .flags
            .intersects(SessionFlags::REPLICA_LINK.union(SessionFlags::PRIMARY_LINK))
    {
        let mut routed_keys = keys;
        if spec.name == "EXEC" {
            for queued in session.tx.queued() {
                if let Some(queued_spec) = registry.lookup(&queued.name) {
                    routed_keys.extend(queued_spec.key_args(queued));
                }
            }
        }
        if !routed_keys.is_empty() {
            match engine.cluster.route(&routed_keys) {
                RouteDecision::Local => {}
                RouteDecision::Moved { slot, target } => {
                    return Err(Rejection::new(
                        RejectKind::ClusterRedirect,
                        format!("MOVED {slot} {target}"),
                    ));
                }
                RouteDecision::Ask { slot, target } => {
                    return Err(Rejection::new(
                        RejectKind::ClusterRedirect,
                        format!("ASK {slot} {target}"),
                    ));
                }
                RouteDecision::CrossSlot => {
                    return Err(Rejection::new(
                        RejectKind::ClusterRedirect,
                        "CROSSSLOT Keys in request don't hash to the same slot",
                    ));
                }
            }
        }
    }

    // Gate 5: memory ceiling, after an eviction attempt. Queued commands
    // are re-checked here because queuing cost is unbounded, and a session
    // inside a transaction may not grow the queue under pressure either
    // (commit and discard stay allowed so the client can resolve it).
    if config.maxmemory_bytes > 0 && !engine.state.script_timedout {
        let under_limit = maxmemory::free_memory_if_needed(
            config,
            &mut *engine.state,
            &mut *engine.store,
            &mut *engine.log,
            &mut *engine.feed,
        );
        let mut reject_on_oom = effective.use_memory;
        if session.tx.is_open() && spec.name != "EXEC" && spec.name != "DISCARD" {
            reject_on_oom = true;
        }
        if !under_limit && reject_on_oom {
            return Err(Rejection::new(
                RejectKind::OutOfMemory,
                "OOM command not allowed when used memory > 'maxmemory'.",
            ));
        }
    }

    // Gate 6: persistence health. Liveness pings are included in the ban
    // because they are used for failure detection.
    if config.stop_writes_on_persist_error
        && engine.state.role == NodeRole::Primary
        && (effective.write || spec.name == "PING")
    {
        if !config.save_points.is_empty() && engine.state.snapshot_status == PersistStatus::Failed
        {
            return Err(Rejection::new(
                RejectKind::PersistenceSnapshot,
                "MISCONF errors writing the dataset snapshot. Commands that may modify the \
                 dataset are disabled. Check server logs for details.",
            ));
        }
        if engine.log.enabled() && engine.state.log_status == PersistStatus::Failed {
            return Err(Rejection::new(
                RejectKind::PersistenceLog,
                "MISCONF errors writing to the durable command log. Commands that may modify \
                 the dataset are disabled. Check server logs for details.",
            ));
        }
    }

    // Gate 7: replica quorum for writes.
    if engine.state.role == NodeRole::Primary
        && config.min_replicas_to_write > 0
        && config.min_replicas_max_lag_secs > 0
        && effective.write
        && engine.state.good_replicas < config.min_replicas_to_write
    {
        return Err(Rejection::new(
            RejectKind::NoGoodReplicas,
            "NOREPLICAS not enough good replicas to write.",
        ));
    }

    // Gate 8: read-only replica. The upstream link itself may write.
    if engine.state.role == NodeRole::Replica
        && config.replica_read_only
        && effective.write
        && !session.flags.contains(SessionFlags::PRIMARY_LINK)
    {
        return Err(Rejection::new(
            RejectKind::ReadOnlyReplica,
            "READONLY you can't write against a read only replica.",
        ));
    }

    // Gate 9: reduced protocol mode.
    if session.flags.contains(SessionFlags::PUBSUB_MODE)
        && !matches!(
            spec.name,
            "PING" | "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE"
        )
    {
        return Err(Rejection::new(
            RejectKind::PubSubContext,
            format!(
                "ERR can't execute '{}': only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT are \
                 allowed in this context",
                spec.name.to_ascii_lowercase()
            ),
        ));
    }

    // Gate 10: stale-data policy.
    if engine.state.role == NodeRole::Replica
        && engine.state.link == LinkState::Broken
        && !config.replica_serve_stale_data
        && !effective.stale_ok
    {
        return Err(Rejection::new(
            RejectKind::StaleReplica,
            "MASTERDOWN link with the primary is down and replica-serve-stale-data is set to \
             'no'.",
        ));
    }

    // Gate 11: loading gate.
    if engine.state.loading && !effective.loading_ok {
        return Err(Rejection::new(
            RejectKind::Loading,
            "LOADING server is loading the dataset in memory",
        ));
    }

    // Gate 12: script-timeout lockdown.
    if engine.state.script_timedout && !allowed_during_busy_script(spec, frame) {
        return Err(Rejection::new(
            RejectKind::BusyScript,
            "BUSY server is busy running a script. You can only call SCRIPT KILL or SHUTDOWN \
             NOSAVE.",
        ));
    }

    Ok(())
}

fn allowed_during_busy_script(spec: &CommandSpec, frame: &CommandFrame) -> bool {
    match spec.name {
        "AUTH" | "MULTI" | "DISCARD" | "WATCH" | "UNWATCH" => true,
        "SHUTDOWN" => frame
            .args
            .first()
            .is_some_and(|arg| arg.eq_ignore_ascii_case(b"NOSAVE")),
        "SCRIPT" => frame
            .args
            .first()
            .is_some_and(|arg| arg.eq_ignore_ascii_case(b"KILL")),
        _ => false,
    }
}

fn audit_denial(
    engine: &mut EngineContext<'_>,
    session: &Session,
    spec: &CommandSpec,
    key_denied: bool,
) {
    tracing::warn!(
        user = %session.user,
        command = spec.name,
        key_denied,
        "access denied"
    );
    let at = engine.state.unix_ms;
    engine.state.acl_audit.push(AclAuditEntry {
        user: session.user.clone(),
        command: spec.name.to_owned(),
        key_denied,
        at,
    });
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use rstest::rstest;

    use super::{admit, arity_rejection, unknown_command_rejection, RejectKind};
    use crate::flags::SessionFlags;
    use crate::keyspace::DataStore;
    use crate::routing::RouteDecision;
    use crate::session::Session;
    use crate::state::{LinkState, NodeRole, PersistStatus};
    use crate::testutil::{frame, TestEngine};

    fn session() -> Session {
        Session::new(1, 1_000_000, false)
    }

    fn admit_kind(test: &mut TestEngine, session: &Session, parts: &[&[u8]]) -> Option<RejectKind> {
        let command = frame(parts);
        let spec = test
            .registry
            .lookup(&command.name)
            .cloned()
            .expect("command must exist for this check");
        let mut engine = test.ctx();
        admit(&mut engine, session, &spec, &command)
            .err()
            .map(|rejection| rejection.kind)
    }

    #[rstest]
    fn unknown_command_and_arity_are_distinct_client_errors() {
        let rejection = unknown_command_rejection("FROB");
        assert_that!(rejection.kind, eq(RejectKind::UnknownCommand));
        assert_that!(rejection.message.starts_with("ERR unknown command"), eq(true));

        let test = TestEngine::new();
        let get = test.registry.lookup("GET").expect("builtin GET");
        let bad = frame(&[b"GET", b"k1", b"extra"]);
        let rejection = arity_rejection(get, &bad).expect("arity must fail");
        assert_that!(rejection.kind, eq(RejectKind::WrongArity));
        assert_that!(
            rejection.message.as_str(),
            eq("ERR wrong number of arguments for 'get' command")
        );

        let set = test.registry.lookup("SET").expect("builtin SET");
        let short = frame(&[b"SET", b"k1"]);
        assert_that!(arity_rejection(set, &short).is_some(), eq(true));
        let ok = frame(&[b"SET", b"k1", b"v1"]);
        assert_that!(arity_rejection(set, &ok).is_none(), eq(true));
    }

    #[rstest]
    fn unauthenticated_sessions_may_only_run_exempt_commands() {
        let mut test = TestEngine::new();
        test.acl = crate::acl::AccessControl::with_default_password("sesame");
        let mut session = Session::new(1, 0, true);
        session.authenticated = false;

        assert_that!(
            admit_kind(&mut test, &session, &[b"GET", b"k"]),
            eq(Some(RejectKind::NoAuth))
        );
        assert_that!(
            admit_kind(&mut test, &session, &[b"AUTH", b"sesame"]),
            eq(None)
        );
    }

    #[rstest]
    fn acl_denials_are_split_by_command_and_key_and_audited() {
        let mut test = TestEngine::new();
        test.acl.upsert_user(crate::acl::AclUser::restricted(
            "reader",
            None,
            &["GET"],
            &[b"cache:*"],
        ));
        let mut session = session();
        session.user = "reader".to_owned();

        assert_that!(
            admit_kind(&mut test, &session, &[b"SET", b"cache:a", b"v"]),
            eq(Some(RejectKind::AclCommand))
        );
        assert_that!(
            admit_kind(&mut test, &session, &[b"GET", b"secret"]),
            eq(Some(RejectKind::AclKey))
        );
        assert_that!(
            admit_kind(&mut test, &session, &[b"GET", b"cache:a"]),
            eq(None)
        );

        assert_that!(test.state.acl_audit.len(), eq(2_usize));
        assert_that!(test.state.acl_audit[0].key_denied, eq(false));
        assert_that!(test.state.acl_audit[1].key_denied, eq(true));
    }

    #[rstest]
    fn cluster_redirections_abort_before_execution() {
        let mut test = TestEngine::new();
        test.cluster.enabled = true;
        test.cluster.decision = RouteDecision::Moved {
            slot: 42,
            target: "10.0.0.9:7000".to_owned(),
        };
        let session = session();

        let command = frame(&[b"GET", b"k"]);
        let spec = test.registry.lookup("GET").cloned().expect("builtin GET");
        let rejection = {
            let mut engine = test.ctx();
            admit(&mut engine, &session, &spec, &command).err()
        }
        .expect("moved slot must redirect");
        assert_that!(rejection.kind, eq(RejectKind::ClusterRedirect));
        assert_that!(rejection.message.as_str(), eq("MOVED 42 10.0.0.9:7000"));

        test.cluster.decision = RouteDecision::CrossSlot;
        assert_that!(
            admit_kind(&mut test, &session, &[b"MGET", b"a", b"b"]),
            eq(Some(RejectKind::ClusterRedirect))
        );

        // Keyless commands are never routed.
        assert_that!(admit_kind(&mut test, &session, &[b"PING"]), eq(None));
    }

    #[rstest]
    fn internal_links_bypass_cluster_routing() {
        let mut test = TestEngine::new();
        test.cluster.enabled = true;
        test.cluster.decision = RouteDecision::CrossSlot;
        let mut session = session();
        session.flags.insert(SessionFlags::PRIMARY_LINK);

        assert_that!(admit_kind(&mut test, &session, &[b"GET", b"k"]), eq(None));
    }

    #[rstest]
    fn memory_pressure_rejects_growth_but_not_reads() {
        let mut test = TestEngine::new();
        test.store.inner.set_string(0, b"ballast", vec![0_u8; 4096]);
        test.config.maxmemory_bytes = 1;
        let session = session();

        assert_that!(
            admit_kind(&mut test, &session, &[b"SET", b"k", b"v"]),
            eq(Some(RejectKind::OutOfMemory))
        );
        assert_that!(admit_kind(&mut test, &session, &[b"GET", b"k"]), eq(None));
        // No gate mutated the dataset.
        assert_that!(test.store.mutations, eq(0_usize));
    }

    #[rstest]
    fn queueing_into_a_transaction_is_rejected_under_memory_pressure() {
        let mut test = TestEngine::new();
        test.store.inner.set_string(0, b"ballast", vec![0_u8; 4096]);
        test.config.maxmemory_bytes = 1;
        let mut session = session();
        assert_that!(session.tx.begin(), eq(true));

        // Even a plain read may not grow the queue, but the commit and the
        // discard stay available.
        assert_that!(
            admit_kind(&mut test, &session, &[b"GET", b"k"]),
            eq(Some(RejectKind::OutOfMemory))
        );
        assert_that!(admit_kind(&mut test, &session, &[b"DISCARD"]), eq(None));
        assert_that!(admit_kind(&mut test, &session, &[b"EXEC"]), eq(None));

        session.tx.queue(frame(&[b"SET", b"k", b"v"]));
        assert_that!(
            admit_kind(&mut test, &session, &[b"EXEC"]),
            eq(Some(RejectKind::OutOfMemory))
        );
    }

    #[rstest]
    fn persistence_failures_suspend_writes_with_distinct_messages() {
        let mut test = TestEngine::new();
        test.state.snapshot_status = PersistStatus::Failed;
        let session = session();

        assert_that!(
            admit_kind(&mut test, &session, &[b"SET", b"k", b"v"]),
            eq(Some(RejectKind::PersistenceSnapshot))
        );
        // Liveness pings are part of the write ban.
        assert_that!(
            admit_kind(&mut test, &session, &[b"PING"]),
            eq(Some(RejectKind::PersistenceSnapshot))
        );
        assert_that!(admit_kind(&mut test, &session, &[b"GET", b"k"]), eq(None));

        test.state.snapshot_status = PersistStatus::Ok;
        test.state.log_status = PersistStatus::Failed;
        assert_that!(
            admit_kind(&mut test, &session, &[b"SET", b"k", b"v"]),
            eq(Some(RejectKind::PersistenceLog))
        );

        test.config.stop_writes_on_persist_error = false;
        assert_that!(admit_kind(&mut test, &session, &[b"SET", b"k", b"v"]), eq(None));
    }

    #[rstest]
    fn replica_quorum_policy_gates_writes() {
        let mut test = TestEngine::new();
        test.config.min_replicas_to_write = 2;
        test.state.good_replicas = 1;
        let session = session();

        assert_that!(
            admit_kind(&mut test, &session, &[b"SET", b"k", b"v"]),
            eq(Some(RejectKind::NoGoodReplicas))
        );
        assert_that!(admit_kind(&mut test, &session, &[b"GET", b"k"]), eq(None));

        test.state.good_replicas = 2;
        assert_that!(admit_kind(&mut test, &session, &[b"SET", b"k", b"v"]), eq(None));
    }

    #[rstest]
    fn read_only_replicas_reject_external_writes() {
        let mut test = TestEngine::new();
        test.state.role = NodeRole::Replica;
        let session = session();

        assert_that!(
            admit_kind(&mut test, &session, &[b"SET", b"k", b"v"]),
            eq(Some(RejectKind::ReadOnlyReplica))
        );
        assert_that!(test.store.mutations, eq(0_usize));
        assert_that!(admit_kind(&mut test, &session, &[b"GET", b"k"]), eq(None));

        let mut upstream = Session::new(2, 0, false);
        upstream.flags.insert(SessionFlags::PRIMARY_LINK);
        assert_that!(admit_kind(&mut test, &upstream, &[b"SET", b"k", b"v"]), eq(None));
    }

    #[rstest]
    fn reduced_protocol_mode_allows_only_the_subscribe_family() {
        let mut test = TestEngine::new();
        let mut session = session();
        session.flags.insert(SessionFlags::PUBSUB_MODE);

        assert_that!(
            admit_kind(&mut test, &session, &[b"GET", b"k"]),
            eq(Some(RejectKind::PubSubContext))
        );
        assert_that!(admit_kind(&mut test, &session, &[b"PING"]), eq(None));
        assert_that!(
            admit_kind(&mut test, &session, &[b"SUBSCRIBE", b"news"]),
            eq(None)
        );
        assert_that!(
            admit_kind(&mut test, &session, &[b"UNSUBSCRIBE"]),
            eq(None)
        );
    }

    #[rstest]
    fn stale_replicas_only_serve_stale_tolerant_commands() {
        let mut test = TestEngine::new();
        test.state.role = NodeRole::Replica;
        test.state.link = LinkState::Broken;
        test.config.replica_serve_stale_data = false;
        let session = session();

        assert_that!(
            admit_kind(&mut test, &session, &[b"GET", b"k"]),
            eq(Some(RejectKind::StaleReplica))
        );
        assert_that!(admit_kind(&mut test, &session, &[b"PING"]), eq(None));

        test.config.replica_serve_stale_data = true;
        assert_that!(admit_kind(&mut test, &session, &[b"GET", b"k"]), eq(None));
    }

    #[rstest]
    fn loading_gate_blocks_commands_without_the_loading_flag() {
        let mut test = TestEngine::new();
        test.state.loading = true;
        let session = session();

        assert_that!(
            admit_kind(&mut test, &session, &[b"GET", b"k"]),
            eq(Some(RejectKind::Loading))
        );
        assert_that!(admit_kind(&mut test, &session, &[b"SELECT", b"1"]), eq(None));
        assert_that!(admit_kind(&mut test, &session, &[b"MULTI"]), eq(None));
    }

    #[rstest]
    fn busy_script_lockdown_keeps_the_escape_hatches_open() {
        let mut test = TestEngine::new();
        test.state.script_timedout = true;
        let session = session();

        assert_that!(
            admit_kind(&mut test, &session, &[b"GET", b"k"]),
            eq(Some(RejectKind::BusyScript))
        );
        assert_that!(
            admit_kind(&mut test, &session, &[b"SHUTDOWN"]),
            eq(Some(RejectKind::BusyScript))
        );
        assert_that!(
            admit_kind(&mut test, &session, &[b"SHUTDOWN", b"NOSAVE"]),
            eq(None)
        );
        assert_that!(
            admit_kind(&mut test, &session, &[b"SCRIPT", b"KILL"]),
            eq(None)
        );
        assert_that!(admit_kind(&mut test, &session, &[b"MULTI"]), eq(None));
        assert_that!(admit_kind(&mut test, &session, &[b"UNWATCH"]), eq(None));
    }

    #[rstest]
    fn a_commit_inherits_the_write_nature_of_its_queue() {
        let mut test = TestEngine::new();
        test.state.role = NodeRole::Replica;
        let mut session = session();
        assert_that!(session.tx.begin(), eq(true));
        session.tx.queue(frame(&[b"GET", b"k"]));

        // A read-only queue commits fine on a read-only replica.
        assert_that!(admit_kind(&mut test, &session, &[b"EXEC"]), eq(None));

        session.tx.queue(frame(&[b"SET", b"k", b"v"]));
        assert_that!(
            admit_kind(&mut test, &session, &[b"EXEC"]),
            eq(Some(RejectKind::ReadOnlyReplica))
        );
    }

    #[rstest]
    fn gate_order_puts_authentication_before_state_gates() {
        let mut test = TestEngine::new();
        test.acl = crate::acl::AccessControl::with_default_password("sesame");
        test.state.loading = true;
        let mut session = Session::new(1, 0, true);
        session.authenticated = false;

        // Both the auth and the loading gate would fire; auth comes first.
        assert_that!(
            admit_kind(&mut test, &session, &[b"GET", b"k"]),
            eq(Some(RejectKind::NoAuth))
        );
    }
}
