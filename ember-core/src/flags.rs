//! Typed flag sets for commands, sessions and call sites.
//!
//! Command behaviour flags are parsed once from a declaration string when
//! the registry is built; at runtime only the bit operations below run.
//! An unrecognized token in a declaration is a registration error, surfaced
//! before the server accepts its first command.

use ember_common::error::{EmberError, EmberResult};

macro_rules! flag_set_ops {
    ($name:ident) => {
        impl $name {
            /// The empty set.
            pub const NONE: Self = Self(0);

            /// Returns whether every flag in `other` is set.
            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Returns whether at least one flag in `other` is set.
            #[must_use]
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            /// Returns the union of both sets.
            #[must_use]
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            /// Returns this set without the flags in `other`.
            #[must_use]
            pub const fn difference(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }

            /// Returns the intersection of both sets.
            #[must_use]
            pub const fn intersection(self, other: Self) -> Self {
                Self(self.0 & other.0)
            }

            /// Adds all flags in `other`.
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            /// Clears all flags in `other`.
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            /// Returns whether no flag is set.
            #[must_use]
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }
        }
    };
}

/// Behavioural flags attached to a command descriptor at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CommandFlags(u32);

flag_set_ops!(CommandFlags);

impl CommandFlags {
    /// Command mutates the dataset.
    pub const WRITE: Self = Self(1 << 0);
    /// Command only reads the dataset.
    pub const READONLY: Self = Self(1 << 1);
    /// Command may grow memory use and is rejected under memory pressure.
    pub const USE_MEMORY: Self = Self(1 << 2);
    /// Administrative command, never mirrored to observers.
    pub const ADMIN: Self = Self(1 << 3);
    /// Publish/subscribe command, allowed in the reduced protocol mode.
    pub const PUBSUB: Self = Self(1 << 4);
    /// Command must not run from a server-side script.
    pub const NO_SCRIPT: Self = Self(1 << 5);
    /// Command result is non-deterministic.
    pub const RANDOM: Self = Self(1 << 6);
    /// Command may suspend the calling connection.
    pub const BLOCKING: Self = Self(1 << 7);
    /// Constant or near-constant time command.
    pub const FAST: Self = Self(1 << 8);
    /// Command is allowed while a bulk dataset load is in progress.
    pub const LOADING_OK: Self = Self(1 << 9);
    /// Command is allowed on a replica with a broken upstream link.
    pub const STALE_OK: Self = Self(1 << 10);
    /// Command is never mirrored to observer connections.
    pub const SKIP_OBSERVER: Self = Self(1 << 11);
    /// Command is never sampled into the slow-command log.
    pub const SKIP_SLOWLOG: Self = Self(1 << 12);
    /// Command runs on unauthenticated sessions.
    pub const NO_AUTH: Self = Self(1 << 13);

    /// Parses a whitespace-separated declaration string.
    ///
    /// # Errors
    ///
    /// Returns `EmberError::InvalidConfig` on the first unrecognized token.
    /// Command tables are built from literals, so this failing means the
    /// table itself is corrupt and startup must not proceed.
    pub fn parse(declaration: &str) -> EmberResult<Self> {
        let mut flags = Self::NONE;
        for token in declaration.split_whitespace() {
            let flag = match token {
                "write" => Self::WRITE,
                "readonly" => Self::READONLY,
                "use-memory" => Self::USE_MEMORY,
                "admin" => Self::ADMIN,
                "pubsub" => Self::PUBSUB,
                "no-script" => Self::NO_SCRIPT,
                "random" => Self::RANDOM,
                "blocking" => Self::BLOCKING,
                "fast" => Self::FAST,
                "ok-loading" => Self::LOADING_OK,
                "ok-stale" => Self::STALE_OK,
                "skip-observer" => Self::SKIP_OBSERVER,
                "skip-slowlog" => Self::SKIP_SLOWLOG,
                "no-auth" => Self::NO_AUTH,
                unknown => {
                    return Err(EmberError::InvalidConfig(format!(
                        "unknown command flag token '{unknown}'"
                    )));
                }
            };
            flags.insert(flag);
        }
        Ok(flags)
    }
}

/// Per-connection flags mutated over a session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SessionFlags(u32);

flag_set_ops!(SessionFlags);

impl SessionFlags {
    /// Connection is a downstream replica link.
    pub const REPLICA_LINK: Self = Self(1 << 0);
    /// Connection is the upstream primary link on a replica node.
    pub const PRIMARY_LINK: Self = Self(1 << 1);
    /// Connection is a passive observer receiving command mirrors.
    pub const OBSERVER: Self = Self(1 << 2);
    /// Connection is in the reduced subscribe/publish protocol mode.
    pub const PUBSUB_MODE: Self = Self(1 << 3);
    /// Connection opted into read-key tracking for cache invalidation.
    pub const TRACKING: Self = Self(1 << 4);
    /// Force durable-log propagation for the current call.
    pub const FORCE_LOG: Self = Self(1 << 5);
    /// Force replica propagation for the current call.
    pub const FORCE_REPL: Self = Self(1 << 6);
    /// Suppress durable-log propagation for the current call.
    pub const PREVENT_LOG: Self = Self(1 << 7);
    /// Suppress replica propagation for the current call.
    pub const PREVENT_REPL: Self = Self(1 << 8);
    /// Close the connection once pending replies are flushed.
    pub const CLOSE_AFTER_REPLY: Self = Self(1 << 9);
    /// Close the connection after the in-flight command completes.
    pub const CLOSE_AFTER_COMMAND: Self = Self(1 << 10);
    /// Session is currently executing a committed transaction, so extra
    /// ops are already inside an open envelope.
    pub const IN_EXEC: Self = Self(1 << 11);

    /// All per-call propagation-control flags. Cleared before a handler
    /// runs and restored afterwards so nested calls stay isolated.
    pub const PROPAGATION_CONTROL: Self =
        Self(Self::FORCE_LOG.0 | Self::FORCE_REPL.0 | Self::PREVENT_LOG.0 | Self::PREVENT_REPL.0);

    /// The two force flags, the part that bubbles to an outer caller.
    pub const FORCE_MASK: Self = Self(Self::FORCE_LOG.0 | Self::FORCE_REPL.0);
}

/// Flags controlling one dispatcher invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CallFlags(u32);

flag_set_ops!(CallFlags);

impl CallFlags {
    /// Sample slow executions into the slow-command log.
    pub const SLOWLOG: Self = Self(1 << 0);
    /// Update per-command call statistics.
    pub const STATS: Self = Self(1 << 1);
    /// Allow propagation into the durable log.
    pub const PROPAGATE_LOG: Self = Self(1 << 2);
    /// Allow propagation to replica streams.
    pub const PROPAGATE_REPL: Self = Self(1 << 3);
    /// Never wrap accumulated extra ops in a transaction envelope.
    pub const NO_WRAP: Self = Self(1 << 4);

    /// Both propagation targets.
    pub const PROPAGATE: Self = Self(Self::PROPAGATE_LOG.0 | Self::PROPAGATE_REPL.0);

    /// The regular top-level invocation: stats, slowlog and propagation.
    pub const FULL: Self =
        Self(Self::SLOWLOG.0 | Self::STATS.0 | Self::PROPAGATE_LOG.0 | Self::PROPAGATE_REPL.0);
}

#[cfg(test)]
mod tests {
    use super::{CallFlags, CommandFlags, SessionFlags};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn parse_accepts_known_tokens() {
        let flags = CommandFlags::parse("write use-memory fast").expect("valid declaration");
        assert_that!(flags.contains(CommandFlags::WRITE), eq(true));
        assert_that!(flags.contains(CommandFlags::USE_MEMORY), eq(true));
        assert_that!(flags.contains(CommandFlags::FAST), eq(true));
        assert_that!(flags.contains(CommandFlags::ADMIN), eq(false));
    }

    #[rstest]
    #[case("wrte")]
    #[case("write deny-oom")]
    #[case("readonly FAST")]
    fn parse_rejects_unknown_tokens(#[case] declaration: &str) {
        assert_that!(CommandFlags::parse(declaration).is_err(), eq(true));
    }

    #[rstest]
    fn parse_of_empty_declaration_is_empty_set() {
        let flags = CommandFlags::parse("").expect("empty declaration is valid");
        assert_that!(flags.is_empty(), eq(true));
    }

    #[rstest]
    fn propagation_control_mask_covers_force_and_prevent() {
        let mut flags = SessionFlags::NONE;
        flags.insert(SessionFlags::FORCE_REPL);
        flags.insert(SessionFlags::PREVENT_LOG);
        assert_that!(flags.intersects(SessionFlags::PROPAGATION_CONTROL), eq(true));
        flags.remove(SessionFlags::PROPAGATION_CONTROL);
        assert_that!(flags.is_empty(), eq(true));
    }

    #[rstest]
    fn full_call_flags_include_both_targets_but_not_nowrap() {
        assert_that!(CallFlags::FULL.contains(CallFlags::PROPAGATE), eq(true));
        assert_that!(CallFlags::FULL.contains(CallFlags::NO_WRAP), eq(false));
    }
}
