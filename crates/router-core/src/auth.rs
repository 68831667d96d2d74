//! Client authentication against the user directory.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use fv_types::user::User;
use password_hash::{PasswordHash, PasswordVerifier};
use rand::rngs::OsRng;

use crate::directory::Directory;
use crate::error::{RouterError, RouterResult};

/// Verdict of a password check. Failures carry no detail by design; the
/// peer gets an opaque rejection either way.
pub enum AuthDecision {
    Accept(User),
    Reject,
}

/// Verify a username/password pair. Unknown users, disabled users, storage
/// errors, and malformed verifiers all collapse into `Reject`.
pub async fn authenticate_password(directory: &Directory, username: &str, password: &str) -> RouterResult<AuthDecision> {
    let user = match directory.find_user(username).await {
        Ok(Some(user)) => user,
        Ok(None) => return Ok(AuthDecision::Reject),
        Err(e) => {
            tracing::error!(error = %e, "failed to look up user during authentication");
            return Ok(AuthDecision::Reject);
        }
    };

    if !user.is_enabled() || user.verifier.is_empty() {
        return Ok(AuthDecision::Reject);
    }

    let parsed = match PasswordHash::new(&user.verifier) {
        Ok(ph) => ph,
        Err(e) => {
            tracing::error!(error = %e, user = %user.username, "invalid stored verifier");
            return Ok(AuthDecision::Reject);
        }
    };

    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(_) => Ok(AuthDecision::Accept(user)),
        Err(_) => Ok(AuthDecision::Reject),
    }
}

/// Hash a password into its stored PHC verifier form.
pub fn hash_password(password: &str) -> RouterResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hashed = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| RouterError::PasswordHash(format!("failed to hash password: {e}")))?
        .to_string();
    Ok(hashed)
}

const RATE_WINDOW: Duration = Duration::from_secs(60);
const RATE_MAX_FAILURES: u32 = 5;

/// Per-source failure counter. A source that fails too often inside the
/// window is refused before the directory is consulted at all.
#[derive(Default)]
pub struct AuthRateLimiter {
    entries: Mutex<HashMap<IpAddr, (u32, Instant)>>,
}

impl AuthRateLimiter {
    pub fn allows(&self, source: IpAddr) -> bool {
        let mut entries = self.entries.lock().expect("rate limiter poisoned");
        match entries.get(&source) {
            Some((failures, since)) => {
                if since.elapsed() > RATE_WINDOW {
                    entries.remove(&source);
                    true
                } else {
                    *failures < RATE_MAX_FAILURES
                }
            }
            None => true,
        }
    }

    pub fn record_failure(&self, source: IpAddr) {
        let mut entries = self.entries.lock().expect("rate limiter poisoned");
        let entry = entries.entry(source).or_insert((0, Instant::now()));
        if entry.1.elapsed() > RATE_WINDOW {
            *entry = (0, Instant::now());
        }
        entry.0 += 1;
    }

    pub fn record_success(&self, source: IpAddr) {
        self.entries.lock().expect("rate limiter poisoned").remove(&source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_round_trips() {
        let verifier = hash_password("hunter2").unwrap();
        let parsed = PasswordHash::new(&verifier).unwrap();
        assert!(Argon2::default().verify_password(b"hunter2", &parsed).is_ok());
        assert!(Argon2::default().verify_password(b"hunter3", &parsed).is_err());
    }

    #[test]
    fn limiter_blocks_after_repeated_failures() {
        let limiter = AuthRateLimiter::default();
        let source: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..RATE_MAX_FAILURES {
            assert!(limiter.allows(source));
            limiter.record_failure(source);
        }
        assert!(!limiter.allows(source));

        // Another source is unaffected.
        assert!(limiter.allows("10.0.0.2".parse().unwrap()));

        limiter.record_success(source);
        assert!(limiter.allows(source));
    }
}
