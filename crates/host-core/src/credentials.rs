//! One-time access password generation.
//!
//! The password gates incoming connections until the next rotation. It is
//! forwarded to the UI helper for display and must never appear in logs.

use rand::{distributions::Alphanumeric, Rng};

pub const DEFAULT_PASSWORD_LENGTH: usize = 8;
pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Generate a random alphanumeric one-time password.
pub fn generate_one_time_password(length: usize) -> String {
    let length = length.max(MIN_PASSWORD_LENGTH);
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_minimum_length() {
        assert_eq!(generate_one_time_password(3).len(), MIN_PASSWORD_LENGTH);
        assert_eq!(generate_one_time_password(12).len(), 12);
    }

    #[test]
    fn passwords_are_alphanumeric() {
        let password = generate_one_time_password(DEFAULT_PASSWORD_LENGTH);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn consecutive_passwords_differ() {
        let a = generate_one_time_password(16);
        let b = generate_one_time_password(16);
        assert_ne!(a, b);
    }
}
