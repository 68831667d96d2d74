//! Typed façade over the persistent directory.
//!
//! One pool serializes all directory access; every write is committed before
//! the call returns, and reads observe all prior writes.

use fv_types::{
    user::{session_access, user_flags, User},
    HostId,
};
use peer_net::KeyHash;
use sqlx::SqlitePool;
use tracing::info;

use crate::auth;
use crate::error::RouterResult;

/// Username seeded by `create-config`. The password matches and must be
/// changed by the operator.
pub const INITIAL_ADMIN_USER: &str = "admin";
pub const INITIAL_ADMIN_PASSWORD: &str = "admin";

#[derive(Clone)]
pub struct Directory {
    pool: SqlitePool,
}

impl Directory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (and migrate) the directory at its configured location.
    pub async fn open() -> RouterResult<Self> {
        let handle = state_store::router_db().await?;
        state_store::migrate_router(&handle).await?;
        Ok(Self::new(handle.into_pool()))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn user_list(&self) -> RouterResult<Vec<User>> {
        Ok(state_store::users::user_list(&self.pool).await?)
    }

    pub async fn add_user(&self, user: &User) -> RouterResult<i64> {
        Ok(state_store::users::add_user(&self.pool, user).await?)
    }

    pub async fn modify_user(&self, user: &User) -> RouterResult<()> {
        Ok(state_store::users::modify_user(&self.pool, user).await?)
    }

    pub async fn remove_user(&self, entry_id: i64) -> RouterResult<()> {
        Ok(state_store::users::remove_user(&self.pool, entry_id).await?)
    }

    pub async fn find_user(&self, username: &str) -> RouterResult<Option<User>> {
        Ok(state_store::users::find_user(&self.pool, username).await?)
    }

    pub async fn host_id(&self, key_hash: &KeyHash) -> RouterResult<Option<HostId>> {
        Ok(state_store::hosts::host_id(&self.pool, key_hash.as_bytes()).await?)
    }

    pub async fn add_host(&self, key_hash: &KeyHash) -> RouterResult<HostId> {
        Ok(state_store::hosts::add_host(&self.pool, key_hash.as_bytes()).await?)
    }

    pub async fn count_hosts(&self) -> RouterResult<i64> {
        Ok(state_store::hosts::count_hosts(&self.pool).await?)
    }

    /// Create a user from a cleartext password, hashing it into a verifier.
    pub async fn create_user(&self, username: &str, password: &str, sessions: u32, flags: u32) -> RouterResult<i64> {
        let user = User {
            entry_id: 0,
            username: username.to_string(),
            verifier: auth::hash_password(password)?,
            sessions,
            flags,
        };
        self.add_user(&user).await
    }

    /// Seed the default administrative account on a fresh directory.
    pub async fn seed_admin_user(&self) -> RouterResult<i64> {
        let id = self
            .create_user(
                INITIAL_ADMIN_USER,
                INITIAL_ADMIN_PASSWORD,
                session_access::ADMIN | session_access::CLIENT,
                user_flags::ENABLED,
            )
            .await?;
        info!(user = INITIAL_ADMIN_USER, "created initial administrative user");
        Ok(id)
    }
}
