//! Credential verification and per-user profile storage.
//!
//! Both are collaborator interfaces: the broker only depends on the traits,
//! and the binary wires in the config-file and JSON-file implementations.

pub mod profile;

pub use profile::{FileProfileStore, ProfileStore};

use crate::config::UserSection;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Account flags attached to an authenticated user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserFlags {
    pub admin: bool,
    /// Account restricted: may play (if the game allows it) but not chat or
    /// spectate, and is hidden from non-admins in the lobby.
    pub account_hold: bool,
    pub banned: bool,
}

/// Result of a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Canonical username plus flags.
    Success { username: String, flags: UserFlags },
    Failure { reason: Option<String> },
}

/// Credential lookup/verification.
pub trait CredentialStore: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> LoginOutcome;

    /// Current flags of an existing account.
    fn flags(&self, username: &str) -> Option<UserFlags>;
}

/// Credentials from the `[users]` table of the config file.
pub struct ConfigCredentials {
    /// Keyed by lowercased username.
    users: HashMap<String, (String, UserSection)>,
}

impl ConfigCredentials {
    pub fn new(users: &HashMap<String, UserSection>) -> Self {
        let users = users
            .iter()
            .map(|(name, section)| (name.to_lowercase(), (name.clone(), section.clone())))
            .collect();
        Self { users }
    }

    fn lookup(&self, username: &str) -> Option<&(String, UserSection)> {
        self.users.get(&username.to_lowercase())
    }
}

impl CredentialStore for ConfigCredentials {
    fn verify(&self, username: &str, password: &str) -> LoginOutcome {
        let Some((canonical, user)) = self.lookup(username) else {
            return LoginOutcome::Failure { reason: None };
        };
        if !constant_time_eq(
            hash_password(password).as_bytes(),
            user.password_sha256.to_lowercase().as_bytes(),
        ) {
            return LoginOutcome::Failure { reason: None };
        }
        if user.banned {
            return LoginOutcome::Failure {
                reason: Some("Account is disabled.".into()),
            };
        }
        LoginOutcome::Success {
            username: canonical.clone(),
            flags: flags_of(user),
        }
    }

    fn flags(&self, username: &str) -> Option<UserFlags> {
        self.lookup(username).map(|(_, user)| flags_of(user))
    }
}

fn flags_of(user: &UserSection) -> UserFlags {
    UserFlags {
        admin: user.admin,
        account_hold: user.account_hold,
        banned: user.banned,
    }
}

/// Hex SHA-256 of a password, as stored in `password_sha256`.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConfigCredentials {
        let mut users = HashMap::new();
        users.insert(
            "Alice".to_string(),
            UserSection {
                password_sha256: hash_password("hunter2"),
                admin: true,
                account_hold: false,
                banned: false,
            },
        );
        users.insert(
            "mallory".to_string(),
            UserSection {
                password_sha256: hash_password("pw"),
                admin: false,
                account_hold: false,
                banned: true,
            },
        );
        ConfigCredentials::new(&users)
    }

    #[test]
    fn login_is_case_insensitive_and_canonicalizes() {
        match store().verify("alice", "hunter2") {
            LoginOutcome::Success { username, flags } => {
                assert_eq!(username, "Alice");
                assert!(flags.admin);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_password_and_unknown_user_fail() {
        assert_eq!(
            store().verify("alice", "nope"),
            LoginOutcome::Failure { reason: None }
        );
        assert_eq!(
            store().verify("bob", "hunter2"),
            LoginOutcome::Failure { reason: None }
        );
    }

    #[test]
    fn banned_account_is_disabled() {
        assert_eq!(
            store().verify("mallory", "pw"),
            LoginOutcome::Failure {
                reason: Some("Account is disabled.".into())
            }
        );
        assert!(store().flags("Mallory").unwrap().banned);
    }

    #[test]
    fn hash_is_hex_sha256() {
        assert_eq!(
            hash_password("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
