//! Command table: descriptors, arity contracts and key-position metadata.
//!
//! Two parallel tables are kept. The live table is what client lookups
//! resolve against and is subject to operator-level renaming; the original
//! table is immutable so internal rewriting logic can always reach a
//! command under its canonical name even when an operator disabled or
//! renamed it externally.

use ember_common::error::{EmberError, EmberResult};

use crate::command::CommandFrame;
use crate::containers::HotMap;
use crate::dispatch::CommandHandler;
use crate::dispatch::handlers_connection::{
    handle_auth, handle_client, handle_echo, handle_monitor, handle_ping, handle_script,
    handle_select, handle_shutdown, handle_wait,
};
use crate::dispatch::handlers_expiry::{
    handle_expire, handle_expireat, handle_persist, handle_pexpire, handle_pexpireat, handle_pttl,
    handle_ttl,
};
use crate::dispatch::handlers_keyspace::{
    handle_dbsize, handle_del, handle_exists, handle_flushall, handle_flushdb, handle_randomkey,
    handle_type,
};
use crate::dispatch::handlers_list::{
    handle_blpop, handle_llen, handle_lpop, handle_lpush, handle_rpush,
};
use crate::dispatch::handlers_pubsub::{handle_publish, handle_subscribe, handle_unsubscribe};
use crate::dispatch::handlers_string::{
    handle_append, handle_decr, handle_get, handle_incr, handle_incrby, handle_mget, handle_set,
    handle_strlen,
};
use crate::dispatch::handlers_txn::{
    handle_discard, handle_exec, handle_multi, handle_unwatch, handle_watch,
};
use crate::flags::CommandFlags;

/// Arity contract over the argument count (command name excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandArity {
    /// Exactly this many arguments.
    Exact(usize),
    /// At least this many arguments.
    AtLeast(usize),
}

/// Where a command's key arguments sit in its argument vector.
#[derive(Debug, Clone, Copy)]
pub enum KeyPositions {
    /// The command names no keys.
    None,
    /// Keys at fixed positions: indices `first..=last` stepping by `step`.
    /// A negative `last` counts from the end of the argument vector.
    Range {
        /// First key index.
        first: usize,
        /// Last key index; negative values count from the end.
        last: isize,
        /// Distance between consecutive key indices.
        step: usize,
    },
    /// Key positions depend on the argument values.
    Dynamic(fn(&CommandFrame) -> Vec<usize>),
}

/// One command table entry. Immutable after registration.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Canonical uppercase name.
    pub name: &'static str,
    /// Arity contract.
    pub arity: CommandArity,
    /// Behaviour flags parsed from the declaration string.
    pub flags: CommandFlags,
    /// Key-position metadata.
    pub keys: KeyPositions,
    /// Implementation callback.
    pub handler: CommandHandler,
}

impl CommandSpec {
    /// Builds a descriptor, parsing the flag declaration string.
    ///
    /// # Errors
    ///
    /// Returns `EmberError::InvalidConfig` when the declaration contains an
    /// unknown flag token. Since tables are built from literals this is a
    /// fatal startup condition, not a per-call one.
    pub fn new(
        name: &'static str,
        arity: CommandArity,
        declaration: &str,
        keys: KeyPositions,
        handler: CommandHandler,
    ) -> EmberResult<Self> {
        Ok(Self {
            name,
            arity,
            flags: CommandFlags::parse(declaration)?,
            keys,
            handler,
        })
    }

    /// Checks the argument count against the arity contract.
    #[must_use]
    pub fn arity_matches(&self, argc: usize) -> bool {
        match self.arity {
            CommandArity::Exact(expected) => argc == expected,
            CommandArity::AtLeast(minimum) => argc >= minimum,
        }
    }

    /// Resolves the key argument indices for one concrete invocation.
    #[must_use]
    pub fn key_indices(&self, frame: &CommandFrame) -> Vec<usize> {
        match self.keys {
            KeyPositions::None => Vec::new(),
            KeyPositions::Range { first, last, step } => {
                let argc = frame.args.len() as isize;
                let resolved_last = if last < 0 { argc + last } else { last };
                if resolved_last < first as isize {
                    return Vec::new();
                }
                (first..=resolved_last as usize)
                    .step_by(step.max(1))
                    .filter(|index| *index < frame.args.len())
                    .collect()
            }
            KeyPositions::Dynamic(extract) => extract(frame),
        }
    }

    /// Borrows the key arguments for one concrete invocation.
    #[must_use]
    pub fn key_args<'f>(&self, frame: &'f CommandFrame) -> Vec<&'f [u8]> {
        self.key_indices(frame)
            .into_iter()
            .filter_map(|index| frame.args.get(index).map(Vec::as_slice))
            .collect()
    }
}

/// The command table pair.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    live: HotMap<String, CommandSpec>,
    original: HotMap<String, CommandSpec>,
}

impl CommandRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry with the full builtin command set.
    ///
    /// # Errors
    ///
    /// Returns `EmberError::InvalidConfig` when a builtin declaration
    /// string is malformed; startup must not continue past that.
    pub fn with_builtin_commands() -> EmberResult<Self> {
        let mut registry = Self::new();
        registry.register_connection_commands()?;
        registry.register_string_commands()?;
        registry.register_keyspace_commands()?;
        registry.register_expiry_commands()?;
        registry.register_list_commands()?;
        registry.register_transaction_commands()?;
        registry.register_pubsub_commands()?;
        Ok(registry)
    }

    fn register_connection_commands(&mut self) -> EmberResult<()> {
        self.register(CommandSpec::new(
            "PING",
            CommandArity::AtLeast(0),
            "ok-stale fast",
            KeyPositions::None,
            handle_ping,
        )?);
        self.register(CommandSpec::new(
            "ECHO",
            CommandArity::Exact(1),
            "fast",
            KeyPositions::None,
            handle_echo,
        )?);
        self.register(CommandSpec::new(
            "AUTH",
            CommandArity::Exact(1),
            "no-auth no-script ok-loading ok-stale fast",
            KeyPositions::None,
            handle_auth,
        )?);
        self.register(CommandSpec::new(
            "SELECT",
            CommandArity::Exact(1),
            "ok-loading ok-stale fast",
            KeyPositions::None,
            handle_select,
        )?);
        self.register(CommandSpec::new(
            "SHUTDOWN",
            CommandArity::AtLeast(0),
            "admin no-script ok-loading ok-stale",
            KeyPositions::None,
            handle_shutdown,
        )?);
        self.register(CommandSpec::new(
            "MONITOR",
            CommandArity::Exact(0),
            "admin no-script ok-loading ok-stale",
            KeyPositions::None,
            handle_monitor,
        )?);
        self.register(CommandSpec::new(
            "SCRIPT",
            CommandArity::AtLeast(1),
            "no-script ok-stale",
            KeyPositions::None,
            handle_script,
        )?);
        self.register(CommandSpec::new(
            "CLIENT",
            CommandArity::AtLeast(1),
            "admin no-script random ok-loading ok-stale",
            KeyPositions::None,
            handle_client,
        )?);
        self.register(CommandSpec::new(
            "WAIT",
            CommandArity::Exact(2),
            "no-script blocking",
            KeyPositions::None,
            handle_wait,
        )?);
        Ok(())
    }

    fn register_string_commands(&mut self) -> EmberResult<()> {
        self.register(CommandSpec::new(
            "GET",
            CommandArity::Exact(1),
            "readonly fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_get,
        )?);
        self.register(CommandSpec::new(
            "SET",
            CommandArity::AtLeast(2),
            "write use-memory",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_set,
        )?);
        self.register(CommandSpec::new(
            "APPEND",
            CommandArity::Exact(2),
            "write use-memory fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_append,
        )?);
        self.register(CommandSpec::new(
            "STRLEN",
            CommandArity::Exact(1),
            "readonly fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_strlen,
        )?);
        self.register(CommandSpec::new(
            "INCR",
            CommandArity::Exact(1),
            "write use-memory fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_incr,
        )?);
        self.register(CommandSpec::new(
            "DECR",
            CommandArity::Exact(1),
            "write use-memory fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_decr,
        )?);
        self.register(CommandSpec::new(
            "INCRBY",
            CommandArity::Exact(2),
            "write use-memory fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_incrby,
        )?);
        self.register(CommandSpec::new(
            "MGET",
            CommandArity::AtLeast(1),
            "readonly fast",
            KeyPositions::Range { first: 0, last: -1, step: 1 },
            handle_mget,
        )?);
        Ok(())
    }

    fn register_keyspace_commands(&mut self) -> EmberResult<()> {
        self.register(CommandSpec::new(
            "DEL",
            CommandArity::AtLeast(1),
            "write",
            KeyPositions::Range { first: 0, last: -1, step: 1 },
            handle_del,
        )?);
        self.register(CommandSpec::new(
            "UNLINK",
            CommandArity::AtLeast(1),
            "write fast",
            KeyPositions::Range { first: 0, last: -1, step: 1 },
            handle_del,
        )?);
        self.register(CommandSpec::new(
            "EXISTS",
            CommandArity::AtLeast(1),
            "readonly fast",
            KeyPositions::Range { first: 0, last: -1, step: 1 },
            handle_exists,
        )?);
        self.register(CommandSpec::new(
            "TYPE",
            CommandArity::Exact(1),
            "readonly fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_type,
        )?);
        self.register(CommandSpec::new(
            "DBSIZE",
            CommandArity::Exact(0),
            "readonly fast",
            KeyPositions::None,
            handle_dbsize,
        )?);
        self.register(CommandSpec::new(
            "FLUSHDB",
            CommandArity::Exact(0),
            "write",
            KeyPositions::None,
            handle_flushdb,
        )?);
        self.register(CommandSpec::new(
            "FLUSHALL",
            CommandArity::Exact(0),
            "write",
            KeyPositions::None,
            handle_flushall,
        )?);
        self.register(CommandSpec::new(
            "RANDOMKEY",
            CommandArity::Exact(0),
            "readonly random",
            KeyPositions::None,
            handle_randomkey,
        )?);
        Ok(())
    }

    fn register_expiry_commands(&mut self) -> EmberResult<()> {
        self.register(CommandSpec::new(
            "EXPIRE",
            CommandArity::Exact(2),
            "write fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_expire,
        )?);
        self.register(CommandSpec::new(
            "PEXPIRE",
            CommandArity::Exact(2),
            "write fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_pexpire,
        )?);
        self.register(CommandSpec::new(
            "EXPIREAT",
            CommandArity::Exact(2),
            "write fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_expireat,
        )?);
        self.register(CommandSpec::new(
            "PEXPIREAT",
            CommandArity::Exact(2),
            "write fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_pexpireat,
        )?);
        self.register(CommandSpec::new(
            "TTL",
            CommandArity::Exact(1),
            "readonly fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_ttl,
        )?);
        self.register(CommandSpec::new(
            "PTTL",
            CommandArity::Exact(1),
            "readonly fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_pttl,
        )?);
        self.register(CommandSpec::new(
            "PERSIST",
            CommandArity::Exact(1),
            "write fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_persist,
        )?);
        Ok(())
    }

    fn register_list_commands(&mut self) -> EmberResult<()> {
        self.register(CommandSpec::new(
            "LPUSH",
            CommandArity::AtLeast(2),
            "write use-memory fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_lpush,
        )?);
        self.register(CommandSpec::new(
            "RPUSH",
            CommandArity::AtLeast(2),
            "write use-memory fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_rpush,
        )?);
        self.register(CommandSpec::new(
            "LPOP",
            CommandArity::Exact(1),
            "write fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_lpop,
        )?);
        self.register(CommandSpec::new(
            "LLEN",
            CommandArity::Exact(1),
            "readonly fast",
            KeyPositions::Range { first: 0, last: 0, step: 1 },
            handle_llen,
        )?);
        self.register(CommandSpec::new(
            "BLPOP",
            CommandArity::AtLeast(2),
            "write no-script blocking",
            KeyPositions::Range { first: 0, last: -2, step: 1 },
            handle_blpop,
        )?);
        Ok(())
    }

    fn register_transaction_commands(&mut self) -> EmberResult<()> {
        self.register(CommandSpec::new(
            "MULTI",
            CommandArity::Exact(0),
            "no-script ok-loading ok-stale fast",
            KeyPositions::None,
            handle_multi,
        )?);
        self.register(CommandSpec::new(
            "EXEC",
            CommandArity::Exact(0),
            "no-script skip-observer skip-slowlog ok-loading ok-stale",
            KeyPositions::None,
            handle_exec,
        )?);
        self.register(CommandSpec::new(
            "DISCARD",
            CommandArity::Exact(0),
            "no-script ok-loading ok-stale fast",
            KeyPositions::None,
            handle_discard,
        )?);
        self.register(CommandSpec::new(
            "WATCH",
            CommandArity::AtLeast(1),
            "no-script ok-loading ok-stale fast",
            KeyPositions::Range { first: 0, last: -1, step: 1 },
            handle_watch,
        )?);
        self.register(CommandSpec::new(
            "UNWATCH",
            CommandArity::Exact(0),
            "no-script ok-loading ok-stale fast",
            KeyPositions::None,
            handle_unwatch,
        )?);
        Ok(())
    }

    fn register_pubsub_commands(&mut self) -> EmberResult<()> {
        self.register(CommandSpec::new(
            "SUBSCRIBE",
            CommandArity::AtLeast(1),
            "pubsub no-script ok-loading ok-stale fast",
            KeyPositions::None,
            handle_subscribe,
        )?);
        self.register(CommandSpec::new(
            "UNSUBSCRIBE",
            CommandArity::AtLeast(0),
            "pubsub no-script ok-loading ok-stale fast",
            KeyPositions::None,
            handle_unsubscribe,
        )?);
        self.register(CommandSpec::new(
            "PUBLISH",
            CommandArity::Exact(2),
            "pubsub ok-loading ok-stale fast",
            KeyPositions::None,
            handle_publish,
        )?);
        Ok(())
    }

    /// Registers or replaces one command in both tables.
    pub fn register(&mut self, spec: CommandSpec) {
        let _ = self.live.insert(spec.name.to_owned(), spec.clone());
        let _ = self.original.insert(spec.name.to_owned(), spec);
    }

    /// Applies operator-level renames to the live table only.
    ///
    /// An empty target name disables the command for external lookups; the
    /// original table keeps resolving it for internal rewriting logic.
    ///
    /// # Errors
    ///
    /// Returns `EmberError::InvalidConfig` when the source command does not
    /// exist in the live table.
    pub fn apply_renames(&mut self, renames: &[(String, String)]) -> EmberResult<()> {
        for (from, to) in renames {
            let from_key = from.to_ascii_uppercase();
            let Some(spec) = self.live.remove(&from_key) else {
                return Err(EmberError::InvalidConfig(format!(
                    "cannot rename unknown command '{from}'"
                )));
            };
            if !to.is_empty() {
                let _ = self.live.insert(to.to_ascii_uppercase(), spec);
            }
        }
        Ok(())
    }

    /// Case-insensitive lookup in the live table.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&CommandSpec> {
        self.live.get(&name.to_ascii_uppercase())
    }

    /// Case-insensitive lookup in the immutable original table.
    #[must_use]
    pub fn lookup_original(&self, name: &str) -> Option<&CommandSpec> {
        self.original.get(&name.to_ascii_uppercase())
    }

    /// Number of live commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether the live table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandArity, CommandRegistry, CommandSpec, KeyPositions};
    use crate::command::CommandFrame;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn builtin_table_resolves_case_insensitively() {
        let registry = CommandRegistry::with_builtin_commands().expect("builtin table is valid");
        assert_that!(registry.lookup("set").is_some(), eq(true));
        assert_that!(registry.lookup("SeT").is_some(), eq(true));
        assert_that!(registry.lookup("NOPE").is_none(), eq(true));
    }

    #[rstest]
    #[case("GET", 1, true)]
    #[case("GET", 2, false)]
    #[case("SET", 1, false)]
    #[case("SET", 2, true)]
    #[case("SET", 5, true)]
    fn arity_contract_checks_argument_counts(
        #[case] name: &str,
        #[case] argc: usize,
        #[case] expected: bool,
    ) {
        let registry = CommandRegistry::with_builtin_commands().expect("builtin table is valid");
        let spec = registry.lookup(name).expect("builtin command");
        assert_that!(spec.arity_matches(argc), eq(expected));
    }

    #[rstest]
    fn range_key_positions_resolve_negative_last_index() {
        let registry = CommandRegistry::with_builtin_commands().expect("builtin table is valid");
        let blpop = registry.lookup("BLPOP").expect("builtin command");
        let frame = CommandFrame::new(
            "BLPOP",
            vec![b"a".to_vec(), b"b".to_vec(), b"0".to_vec()],
        );

        assert_that!(&blpop.key_indices(&frame), eq(&vec![0_usize, 1]));

        let del = registry.lookup("DEL").expect("builtin command");
        let frame = CommandFrame::new("DEL", vec![b"x".to_vec(), b"y".to_vec()]);
        assert_that!(&del.key_indices(&frame), eq(&vec![0_usize, 1]));
    }

    #[rstest]
    fn dynamic_key_positions_run_the_extraction_procedure() {
        fn second_arg_only(_frame: &CommandFrame) -> Vec<usize> {
            vec![1]
        }
        let spec = CommandSpec::new(
            "PROBE",
            CommandArity::AtLeast(2),
            "readonly",
            KeyPositions::Dynamic(second_arg_only),
            crate::dispatch::handlers_string::handle_get,
        )
        .expect("valid declaration");

        let frame = CommandFrame::new("PROBE", vec![b"opt".to_vec(), b"key".to_vec()]);
        let keys = spec.key_args(&frame);
        assert_that!(keys.len(), eq(1_usize));
        assert_that!(keys[0], eq(b"key".as_slice()));
    }

    #[rstest]
    fn malformed_builtin_declaration_is_a_registration_error() {
        let result = CommandSpec::new(
            "BROKEN",
            CommandArity::Exact(0),
            "write turbo",
            KeyPositions::None,
            crate::dispatch::handlers_string::handle_get,
        );
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn renames_affect_only_the_live_table() {
        let mut registry =
            CommandRegistry::with_builtin_commands().expect("builtin table is valid");
        registry
            .apply_renames(&[
                ("FLUSHALL".to_owned(), "WIPEALL".to_owned()),
                ("SHUTDOWN".to_owned(), String::new()),
            ])
            .expect("renames are valid");

        assert_that!(registry.lookup("FLUSHALL").is_none(), eq(true));
        assert_that!(registry.lookup("WIPEALL").is_some(), eq(true));
        assert_that!(registry.lookup("SHUTDOWN").is_none(), eq(true));
        assert_that!(registry.lookup_original("FLUSHALL").is_some(), eq(true));
        assert_that!(registry.lookup_original("SHUTDOWN").is_some(), eq(true));
    }

    #[rstest]
    fn renaming_an_unknown_command_fails_fast() {
        let mut registry =
            CommandRegistry::with_builtin_commands().expect("builtin table is valid");
        let result = registry.apply_renames(&[("NOPE".to_owned(), "YEP".to_owned())]);
        assert_that!(result.is_err(), eq(true));
    }
}
