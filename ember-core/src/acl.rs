//! Access-control subsystem.
//!
//! Identities carry a command allowlist and a set of key patterns. The
//! admission pipeline asks one question per command: may this identity run
//! the command, and may it touch the keys the command names. The two
//! denial outcomes are distinct so the caller can reply with the matching
//! error category and record an audit entry.

use crate::containers::{HotMap, HotSet};

/// Verdict of one permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Command and keys are both allowed.
    Allowed,
    /// The identity may not invoke the command at all.
    DeniedCommand,
    /// The identity may not touch at least one of the key arguments.
    DeniedKey,
}

/// One configured identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclUser {
    /// Identity name.
    pub name: String,
    /// Password required by `AUTH`; `None` means no authentication.
    pub password: Option<String>,
    /// Shortcut for "all commands allowed".
    pub all_commands: bool,
    /// Uppercase command names this identity may invoke.
    pub allowed_commands: HotSet<String>,
    /// Shortcut for "all keys allowed".
    pub all_keys: bool,
    /// Glob patterns the key arguments must match.
    pub key_patterns: Vec<Vec<u8>>,
}

impl AclUser {
    /// Builds an unrestricted identity.
    #[must_use]
    pub fn unrestricted(name: impl Into<String>, password: Option<String>) -> Self {
        Self {
            name: name.into(),
            password,
            all_commands: true,
            allowed_commands: HotSet::new(),
            all_keys: true,
            key_patterns: Vec::new(),
        }
    }

    /// Builds an identity limited to the given commands and key patterns.
    #[must_use]
    pub fn restricted(
        name: impl Into<String>,
        password: Option<String>,
        commands: &[&str],
        key_patterns: &[&[u8]],
    ) -> Self {
        Self {
            name: name.into(),
            password,
            all_commands: false,
            allowed_commands: commands.iter().map(|c| c.to_ascii_uppercase()).collect(),
            all_keys: false,
            key_patterns: key_patterns.iter().map(|p| p.to_vec()).collect(),
        }
    }

    fn allows_command(&self, name: &str) -> bool {
        self.all_commands || self.allowed_commands.contains(name)
    }

    fn allows_key(&self, key: &[u8]) -> bool {
        self.all_keys
            || self
                .key_patterns
                .iter()
                .any(|pattern| glob_match(pattern, key))
    }
}

/// Identity table consulted by admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessControl {
    users: HotMap<String, AclUser>,
}

impl AccessControl {
    /// Builds an access-control table with an unrestricted, password-less
    /// default identity.
    #[must_use]
    pub fn open() -> Self {
        let mut users = HotMap::new();
        let _ = users.insert(
            "default".to_owned(),
            AclUser::unrestricted("default", None),
        );
        Self { users }
    }

    /// Builds an access-control table whose default identity requires the
    /// given password.
    #[must_use]
    pub fn with_default_password(password: impl Into<String>) -> Self {
        let mut users = HotMap::new();
        let _ = users.insert(
            "default".to_owned(),
            AclUser::unrestricted("default", Some(password.into())),
        );
        Self { users }
    }

    /// Registers or replaces one identity.
    pub fn upsert_user(&mut self, user: AclUser) {
        let _ = self.users.insert(user.name.clone(), user);
    }

    /// Whether the named identity must authenticate before running
    /// non-exempt commands.
    #[must_use]
    pub fn auth_required(&self, user: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|entry| entry.password.is_some())
    }

    /// Verifies an `AUTH` attempt for the named identity.
    #[must_use]
    pub fn verify_password(&self, user: &str, attempt: &[u8]) -> bool {
        self.users.get(user).is_some_and(|entry| {
            entry
                .password
                .as_ref()
                .is_some_and(|password| password.as_bytes() == attempt)
        })
    }

    /// Checks whether `user` may run `command` against `keys`.
    ///
    /// Unknown identities are denied at the command level.
    #[must_use]
    pub fn check_permission(&self, user: &str, command: &str, keys: &[&[u8]]) -> Permission {
        let Some(entry) = self.users.get(user) else {
            return Permission::DeniedCommand;
        };
        if !entry.allows_command(command) {
            return Permission::DeniedCommand;
        }
        for key in keys {
            if !entry.allows_key(key) {
                return Permission::DeniedKey;
            }
        }
        Permission::Allowed
    }
}

/// Glob matcher over raw bytes: `*` spans any run, `?` one byte, `\`
/// escapes the next byte.
#[must_use]
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let mut p = 0;
    let mut t = 0;
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        let matched = match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, t));
                p += 1;
                continue;
            }
            Some(b'?') => true,
            Some(b'\\') => pattern.get(p + 1) == Some(&text[t]),
            Some(byte) => *byte == text[t],
            None => false,
        };

        if matched {
            p += if pattern.get(p) == Some(&b'\\') { 2 } else { 1 };
            t += 1;
            continue;
        }

        match star {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    while pattern.get(p) == Some(&b'*') {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::{glob_match, AccessControl, AclUser, Permission};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"*", b"anything", true)]
    #[case(b"user:*", b"user:1001", true)]
    #[case(b"user:*", b"session:1001", false)]
    #[case(b"h?llo", b"hello", true)]
    #[case(b"h?llo", b"hllo", false)]
    #[case(b"a*c*e", b"abcde", true)]
    #[case(b"", b"", true)]
    #[case(b"", b"x", false)]
    fn glob_matcher_covers_star_and_question(
        #[case] pattern: &[u8],
        #[case] text: &[u8],
        #[case] expected: bool,
    ) {
        assert_that!(glob_match(pattern, text), eq(expected));
    }

    #[rstest]
    fn open_table_allows_everything_for_default_user() {
        let acl = AccessControl::open();
        assert_that!(acl.auth_required("default"), eq(false));
        assert_that!(
            acl.check_permission("default", "SET", &[b"any".as_slice()]),
            eq(Permission::Allowed)
        );
    }

    #[rstest]
    fn restricted_user_is_denied_at_command_level_first() {
        let mut acl = AccessControl::open();
        acl.upsert_user(AclUser::restricted(
            "reader",
            None,
            &["GET"],
            &[b"cache:*"],
        ));

        assert_that!(
            acl.check_permission("reader", "SET", &[b"cache:a".as_slice()]),
            eq(Permission::DeniedCommand)
        );
        assert_that!(
            acl.check_permission("reader", "GET", &[b"cache:a".as_slice()]),
            eq(Permission::Allowed)
        );
        assert_that!(
            acl.check_permission("reader", "GET", &[b"secret:a".as_slice()]),
            eq(Permission::DeniedKey)
        );
    }

    #[rstest]
    fn unknown_identity_is_denied() {
        let acl = AccessControl::open();
        assert_that!(
            acl.check_permission("ghost", "GET", &[]),
            eq(Permission::DeniedCommand)
        );
    }

    #[rstest]
    fn password_verification_matches_exact_bytes() {
        let acl = AccessControl::with_default_password("sesame");
        assert_that!(acl.auth_required("default"), eq(true));
        assert_that!(acl.verify_password("default", b"sesame"), eq(true));
        assert_that!(acl.verify_password("default", b"Sesame"), eq(false));
    }
}
