//! Directory user records.

use serde::{Deserialize, Serialize};

/// Bitmask of router session kinds a user may open.
pub mod session_access {
    pub const ADMIN: u32 = 0x01;
    pub const CLIENT: u32 = 0x02;
}

/// Bitmask of user account flags.
pub mod user_flags {
    pub const ENABLED: u32 = 0x01;
}

/// One row of the Router's user directory.
///
/// The password verifier is an opaque PHC string; the cleartext never reaches
/// this type. Usernames are unique case-insensitively.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Persistent primary key; `0` until the directory assigns one.
    pub entry_id: i64,
    pub username: String,
    /// Argon2id PHC verifier string.
    pub verifier: String,
    /// Bitset of permitted session kinds, see [`session_access`].
    pub sessions: u32,
    /// Bitset of account flags, see [`user_flags`].
    pub flags: u32,
}

impl User {
    pub fn is_enabled(&self) -> bool {
        self.flags & user_flags::ENABLED != 0
    }

    pub fn may_open(&self, access: u32) -> bool {
        self.sessions & access != 0
    }

    /// Case-folded form used for uniqueness and lookups.
    pub fn folded_username(&self) -> String {
        fold_username(&self.username)
    }
}

/// Canonical case-fold applied to usernames before comparison.
pub fn fold_username(username: &str) -> String {
    username.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_user_is_not_enabled() {
        let user = User {
            entry_id: 1,
            username: "admin".into(),
            verifier: String::new(),
            sessions: session_access::ADMIN | session_access::CLIENT,
            flags: 0,
        };
        assert!(!user.is_enabled());
        assert!(user.may_open(session_access::CLIENT));
    }

    #[test]
    fn username_fold_is_case_insensitive() {
        assert_eq!(fold_username("Admin"), fold_username("ADMIN"));
        assert_eq!(fold_username("Ügur"), fold_username("ügur"));
    }
}
