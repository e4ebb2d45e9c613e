use googletest::prelude::*;
use rstest::rstest;

use ember_common::ids::DbIndex;

use super::{call, CallContext};
use crate::command::{CommandFrame, CommandReply};
use crate::flags::{CallFlags, SessionFlags};
use crate::keyspace::DataStore;
use crate::propagation::PropTarget;
use crate::registry::{CommandArity, CommandSpec, KeyPositions};
use crate::session::Session;
use crate::state::NodeRole;
use crate::testutil::{frame, TestEngine};

fn session() -> Session {
    Session::new(1, 1_000_000, false)
}

fn record_names(records: &[(DbIndex, CommandFrame)]) -> Vec<String> {
    records.iter().map(|(_, frame)| frame.name.clone()).collect()
}

#[rstest]
fn set_then_get_scenario_matches_dirty_and_propagation() {
    let mut test = TestEngine::new();
    let set = test.registry.lookup("SET").cloned().expect("builtin SET");
    let get = test.registry.lookup("GET").cloned().expect("builtin GET");
    let mut session = session();

    let set_frame = frame(&[b"SET", b"k1", b"v1"]);
    let get_frame = frame(&[b"GET", b"k1"]);
    {
        let mut engine = test.ctx();
        let outcome = call(&mut engine, &mut session, &set, &set_frame, CallFlags::FULL, None);
        assert_that!(outcome.dirty_delta, eq(1_u64));
        assert_that!(&outcome.reply, eq(&Some(CommandReply::ok())));

        let outcome = call(&mut engine, &mut session, &get, &get_frame, CallFlags::FULL, None);
        assert_that!(outcome.dirty_delta, eq(0_u64));
        assert_that!(
            &outcome.reply,
            eq(&Some(CommandReply::BulkString(b"v1".to_vec())))
        );
    }

    // SET reached both sinks, GET reached neither.
    assert_that!(&record_names(&test.log.records), eq(&vec!["SET".to_owned()]));
    assert_that!(&record_names(&test.feed.records), eq(&vec!["SET".to_owned()]));
    // The dirty delta equals the mutating calls the store observed.
    assert_that!(test.store.mutations, eq(1_usize));
}

#[rstest]
fn forced_replication_propagates_without_mutations() {
    let mut test = TestEngine::new();
    let publish = test.registry.lookup("PUBLISH").cloned().expect("builtin PUBLISH");
    let mut session = session();

    let publish_frame = frame(&[b"PUBLISH", b"news", b"hello"]);
    {
        let mut engine = test.ctx();
        let outcome = call(
            &mut engine,
            &mut session,
            &publish,
            &publish_frame,
            CallFlags::FULL,
            None,
        );
        assert_that!(outcome.dirty_delta, eq(0_u64));
    }

    assert_that!(&record_names(&test.feed.records), eq(&vec!["PUBLISH".to_owned()]));
    // Force applied to replication only; the durable log saw nothing.
    assert_that!(test.log.records.is_empty(), eq(true));
    assert_that!(session.flags.contains(SessionFlags::FORCE_REPL), eq(false));
}

fn mutate_and_prevent(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    ctx.engine.store.set_string(session.db, b"probe", b"v".to_vec());
    ctx.engine.state.dirty += 1;
    session
        .flags
        .insert(SessionFlags::PREVENT_LOG.union(SessionFlags::PREVENT_REPL));
    CommandReply::ok()
}

#[rstest]
fn prevented_propagation_overrides_a_nonzero_dirty_delta() {
    let mut test = TestEngine::new();
    let spec = CommandSpec::new(
        "TPROBE",
        CommandArity::Exact(0),
        "write",
        KeyPositions::None,
        mutate_and_prevent,
    )
    .expect("valid declaration");
    let mut session = session();

    let probe_frame = frame(&[b"TPROBE"]);
    {
        let mut engine = test.ctx();
        let outcome = call(&mut engine, &mut session, &spec, &probe_frame, CallFlags::FULL, None);
        assert_that!(outcome.dirty_delta, eq(1_u64));
    }

    assert_that!(test.log.records.is_empty(), eq(true));
    assert_that!(test.feed.records.is_empty(), eq(true));
}

fn emit_three_ops(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    for index in 0..3_u8 {
        ctx.also_propagate(
            session.db,
            frame(&[b"SET", format!("derived:{index}").as_bytes(), b"v"]),
            PropTarget::ALL,
        );
    }
    CommandReply::ok()
}

fn emit_one_op(
    ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    ctx.also_propagate(session.db, frame(&[b"SET", b"derived", b"v"]), PropTarget::ALL);
    CommandReply::ok()
}

#[rstest]
fn three_extra_ops_flush_inside_an_atomic_envelope() {
    let mut test = TestEngine::new();
    let spec = CommandSpec::new(
        "TFANOUT",
        CommandArity::Exact(0),
        "write",
        KeyPositions::None,
        emit_three_ops,
    )
    .expect("valid declaration");
    let mut session = session();

    let fanout_frame = frame(&[b"TFANOUT"]);
    {
        let mut engine = test.ctx();
        let _ = call(&mut engine, &mut session, &spec, &fanout_frame, CallFlags::FULL, None);
    }

    let expected = vec![
        "MULTI".to_owned(),
        "SET".to_owned(),
        "SET".to_owned(),
        "SET".to_owned(),
        "EXEC".to_owned(),
    ];
    assert_that!(&record_names(&test.log.records), eq(&expected));
    assert_that!(&record_names(&test.feed.records), eq(&expected));
}

#[rstest]
fn a_single_extra_op_needs_no_envelope() {
    let mut test = TestEngine::new();
    let spec = CommandSpec::new(
        "TSINGLE",
        CommandArity::Exact(0),
        "write",
        KeyPositions::None,
        emit_one_op,
    )
    .expect("valid declaration");
    let mut session = session();

    let single_frame = frame(&[b"TSINGLE"]);
    {
        let mut engine = test.ctx();
        let _ = call(&mut engine, &mut session, &spec, &single_frame, CallFlags::FULL, None);
    }

    assert_that!(&record_names(&test.log.records), eq(&vec!["SET".to_owned()]));
}

#[rstest]
fn lazy_expiration_on_a_primary_removes_and_records_a_delete() {
    let mut test = TestEngine::new();
    test.store.inner.set_string(0, b"stale", b"v".to_vec());
    let _ = test.store.inner.set_expire(0, b"stale", 999_999);
    let get = test.registry.lookup("GET").cloned().expect("builtin GET");
    let mut session = session();

    let get_frame = frame(&[b"GET", b"stale"]);
    {
        let mut engine = test.ctx();
        let outcome = call(&mut engine, &mut session, &get, &get_frame, CallFlags::FULL, None);
        assert_that!(&outcome.reply, eq(&Some(CommandReply::Null)));
    }

    assert_that!(test.store.inner.key_exists(0, b"stale"), eq(false));
    assert_that!(test.state.stat_expired_keys, eq(1_u64));
    assert_that!(&record_names(&test.log.records), eq(&vec!["DEL".to_owned()]));
    assert_that!(&record_names(&test.feed.records), eq(&vec!["DEL".to_owned()]));
}

#[rstest]
fn a_replica_reports_expired_keys_without_removing_them() {
    let mut test = TestEngine::new();
    test.state.role = NodeRole::Replica;
    test.store.inner.set_string(0, b"stale", b"v".to_vec());
    let _ = test.store.inner.set_expire(0, b"stale", 999_999);
    let get = test.registry.lookup("GET").cloned().expect("builtin GET");
    let mut session = session();

    let get_frame = frame(&[b"GET", b"stale"]);
    {
        let mut engine = test.ctx();
        let outcome = call(&mut engine, &mut session, &get, &get_frame, CallFlags::FULL, None);
        assert_that!(&outcome.reply, eq(&Some(CommandReply::Null)));
    }

    // The key stays until the primary's explicit delete arrives.
    assert_that!(test.store.inner.key_exists(0, b"stale"), eq(true));
    assert_that!(test.log.records.is_empty(), eq(true));
    assert_that!(test.feed.records.is_empty(), eq(true));
}

#[rstest]
fn relative_expirations_are_recorded_as_absolute_deadlines() {
    let mut test = TestEngine::new();
    test.store.inner.set_string(0, b"k", b"v".to_vec());
    let expire = test.registry.lookup("EXPIRE").cloned().expect("builtin EXPIRE");
    let mut session = session();

    let expire_frame = frame(&[b"EXPIRE", b"k", b"100"]);
    {
        let mut engine = test.ctx();
        let outcome = call(&mut engine, &mut session, &expire, &expire_frame, CallFlags::FULL, None);
        assert_that!(&outcome.reply, eq(&Some(CommandReply::Integer(1))));
    }

    assert_that!(test.feed.records.len(), eq(1_usize));
    let (_, record) = &test.feed.records[0];
    assert_that!(record.name.as_str(), eq("PEXPIREAT"));
    // Clock is pinned at 1_000_000 ms in the test engine.
    assert_that!(&record.args[1], eq(&b"1100000".to_vec()));
}

fn force_replication_probe(
    _ctx: &mut CallContext<'_, '_>,
    session: &mut Session,
    _frame: &CommandFrame,
) -> CommandReply {
    session.flags.insert(SessionFlags::FORCE_REPL);
    CommandReply::ok()
}

#[rstest]
fn forced_flags_bubble_to_an_outer_pseudo_session() {
    let mut test = TestEngine::new();
    let spec = CommandSpec::new(
        "TFORCE",
        CommandArity::Exact(0),
        "",
        KeyPositions::None,
        force_replication_probe,
    )
    .expect("valid declaration");
    let mut session = session();
    let mut outer = SessionFlags::NONE;

    let force_frame = frame(&[b"TFORCE"]);
    {
        let mut engine = test.ctx();
        let _ = call(
            &mut engine,
            &mut session,
            &spec,
            &force_frame,
            CallFlags::FULL,
            Some(&mut outer),
        );
    }

    assert_that!(outer.contains(SessionFlags::FORCE_REPL), eq(true));
    // The inner session's own per-call flags were restored.
    assert_that!(session.flags.contains(SessionFlags::FORCE_REPL), eq(false));
}

#[rstest]
fn slowlog_samples_and_stats_accumulate_per_command() {
    let mut test = TestEngine::new();
    test.config.slowlog_threshold_micros = Some(0);
    let get = test.registry.lookup("GET").cloned().expect("builtin GET");
    let mut session = session();

    let get_frame = frame(&[b"GET", b"k"]);
    {
        let mut engine = test.ctx();
        let _ = call(&mut engine, &mut session, &get, &get_frame, CallFlags::FULL, None);
    }

    assert_that!(test.state.slowlog.len(), eq(1_usize));
    assert_that!(test.state.slowlog[0].command.as_str(), eq("GET"));
    let stats = test.state.command_stats.get("GET").copied().unwrap_or_default();
    assert_that!(stats.calls, eq(1_u64));
}

#[rstest]
fn log_replay_suppresses_stats_and_slowlog() {
    let mut test = TestEngine::new();
    test.config.slowlog_threshold_micros = Some(0);
    test.state.loading = true;
    let set = test.registry.lookup("SET").cloned().expect("builtin SET");
    let mut session = session();

    let set_frame = frame(&[b"SET", b"k", b"v"]);
    {
        let mut engine = test.ctx();
        let _ = call(&mut engine, &mut session, &set, &set_frame, CallFlags::FULL, None);
    }

    assert_that!(test.state.slowlog.is_empty(), eq(true));
    assert_that!(test.state.command_stats.get("SET").is_none(), eq(true));
}

#[rstest]
fn exec_wraps_queued_writes_in_one_envelope() {
    let mut test = TestEngine::new();
    let exec = test.registry.lookup("EXEC").cloned().expect("builtin EXEC");
    let mut session = session();
    assert_that!(session.tx.begin(), eq(true));
    session.tx.queue(frame(&[b"SET", b"a", b"1"]));
    session.tx.queue(frame(&[b"SET", b"b", b"2"]));

    let exec_frame = frame(&[b"EXEC"]);
    let outcome = {
        let mut engine = test.ctx();
        call(&mut engine, &mut session, &exec, &exec_frame, CallFlags::FULL, None)
    };

    let Some(CommandReply::Array(replies)) = outcome.reply else {
        panic!("EXEC must reply with an array");
    };
    assert_that!(replies.len(), eq(2_usize));
    let expected = vec![
        "MULTI".to_owned(),
        "SET".to_owned(),
        "SET".to_owned(),
        "EXEC".to_owned(),
    ];
    assert_that!(&record_names(&test.log.records), eq(&expected));
    assert_that!(&record_names(&test.feed.records), eq(&expected));
    assert_that!(session.flags.contains(SessionFlags::IN_EXEC), eq(false));
}

#[rstest]
fn read_only_transactions_never_touch_the_log() {
    let mut test = TestEngine::new();
    test.store.inner.set_string(0, b"a", b"1".to_vec());
    let exec = test.registry.lookup("EXEC").cloned().expect("builtin EXEC");
    let mut session = session();
    assert_that!(session.tx.begin(), eq(true));
    session.tx.queue(frame(&[b"GET", b"a"]));

    let exec_frame = frame(&[b"EXEC"]);
    let outcome = {
        let mut engine = test.ctx();
        call(&mut engine, &mut session, &exec, &exec_frame, CallFlags::FULL, None)
    };

    assert_that!(outcome.reply.is_some(), eq(true));
    assert_that!(test.log.records.is_empty(), eq(true));
}

#[rstest]
fn exec_aborts_when_a_watched_key_changed() {
    let mut test = TestEngine::new();
    test.store.inner.set_string(0, b"w", b"1".to_vec());
    let exec = test.registry.lookup("EXEC").cloned().expect("builtin EXEC");
    let mut session = session();

    let version = test.store.inner.key_version(0, b"w");
    session.watch_key(0, b"w".to_vec(), version);
    assert_that!(session.tx.begin(), eq(true));
    session.tx.queue(frame(&[b"SET", b"other", b"x"]));

    // Another writer touches the watched key before the commit.
    test.store.inner.set_string(0, b"w", b"2".to_vec());

    let exec_frame = frame(&[b"EXEC"]);
    let outcome = {
        let mut engine = test.ctx();
        call(&mut engine, &mut session, &exec, &exec_frame, CallFlags::FULL, None)
    };

    assert_that!(&outcome.reply, eq(&Some(CommandReply::NullArray)));
    assert_that!(test.store.inner.key_exists(0, b"other"), eq(false));
    assert_that!(test.log.records.is_empty(), eq(true));
}

#[rstest]
fn blpop_blocks_and_a_push_signals_readiness() {
    let mut test = TestEngine::new();
    let blpop = test.registry.lookup("BLPOP").cloned().expect("builtin BLPOP");
    let lpush = test.registry.lookup("LPUSH").cloned().expect("builtin LPUSH");
    let mut waiter = session();
    let mut pusher = Session::new(2, 1_000_000, false);

    let blpop_frame = frame(&[b"BLPOP", b"queue", b"5"]);
    let lpush_frame = frame(&[b"LPUSH", b"queue", b"job"]);
    {
        let mut engine = test.ctx();
        let outcome = call(&mut engine, &mut waiter, &blpop, &blpop_frame, CallFlags::FULL, None);
        // No reply yet: the session is suspended.
        assert_that!(outcome.reply.is_none(), eq(true));
    }
    assert_that!(waiter.is_blocked(), eq(true));
    assert_that!(test.state.has_waiters(0, b"queue"), eq(true));
    assert_that!(
        waiter.blocked.as_ref().and_then(|blocked| blocked.deadline),
        eq(Some(1_005_000))
    );

    {
        let mut engine = test.ctx();
        let _ = call(&mut engine, &mut pusher, &lpush, &lpush_frame, CallFlags::FULL, None);
    }
    assert_that!(&test.state.ready_keys, eq(&vec![(0_u16, b"queue".to_vec())]));
}

#[rstest]
fn wait_blocks_until_enough_replicas_acknowledge() {
    let mut test = TestEngine::new();
    let wait = test.registry.lookup("WAIT").cloned().expect("builtin WAIT");
    let mut session = session();

    let wait_frame = frame(&[b"WAIT", b"1", b"100"]);
    {
        let mut engine = test.ctx();
        let outcome = call(&mut engine, &mut session, &wait, &wait_frame, CallFlags::FULL, None);
        assert_that!(outcome.reply.is_none(), eq(true));
    }
    assert_that!(session.is_blocked(), eq(true));
    assert_that!(test.state.get_ack_from_replicas, eq(true));

    // With an acknowledging replica the same command returns immediately.
    session.blocked = None;
    test.feed.acked = 1;
    {
        let mut engine = test.ctx();
        let outcome = call(&mut engine, &mut session, &wait, &wait_frame, CallFlags::FULL, None);
        assert_that!(&outcome.reply, eq(&Some(CommandReply::Integer(1))));
    }
}

#[rstest]
fn tracking_sessions_remember_the_keys_they_read() {
    let mut test = TestEngine::new();
    test.store.inner.set_string(0, b"k", b"v".to_vec());
    let get = test.registry.lookup("GET").cloned().expect("builtin GET");
    let mut session = session();
    session.flags.insert(SessionFlags::TRACKING);

    let get_frame = frame(&[b"GET", b"k"]);
    {
        let mut engine = test.ctx();
        let _ = call(&mut engine, &mut session, &get, &get_frame, CallFlags::FULL, None);
    }

    assert_that!(session.tracked_keys.contains(b"k".as_slice()), eq(true));
}

#[rstest]
fn observers_see_regular_commands_but_not_admin_ones() {
    let mut test = TestEngine::new();
    test.observers.attach(9);
    let set = test.registry.lookup("SET").cloned().expect("builtin SET");
    let shutdown = test.registry.lookup("SHUTDOWN").cloned().expect("builtin SHUTDOWN");
    let mut session = session();

    let set_frame = frame(&[b"SET", b"k", b"v"]);
    let shutdown_frame = frame(&[b"SHUTDOWN", b"NOSAVE"]);
    {
        let mut engine = test.ctx();
        let _ = call(&mut engine, &mut session, &set, &set_frame, CallFlags::FULL, None);
        let _ = call(&mut engine, &mut session, &shutdown, &shutdown_frame, CallFlags::FULL, None);
    }

    let mirrored = test.observers.drain(9);
    assert_that!(mirrored.len(), eq(1_usize));
    assert_that!(mirrored[0].contains("SET"), eq(true));
}
