//! Persistent host registry: public-key digest to Host ID.
//!
//! The key hash is the primary lookup key. Host ids start at 1 and are
//! assigned on first insertion; re-registering the same key returns the
//! existing id.

use fv_types::HostId;
use sqlx::{Row, SqlitePool};

use crate::{current_ts, users::is_unique_violation, DbResult};

/// Resolve a key hash to its Host ID, if registered.
pub async fn host_id(pool: &SqlitePool, key_hash: &[u8]) -> DbResult<Option<HostId>> {
    let row = sqlx::query("SELECT host_id FROM hosts WHERE key_hash = ?")
        .bind(key_hash)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| HostId(r.get::<i64, _>("host_id") as u64)))
}

/// Register a key hash, allocating the next Host ID. Idempotent: a key that
/// is already registered gets its existing id back.
pub async fn add_host(pool: &SqlitePool, key_hash: &[u8]) -> DbResult<HostId> {
    let mut tx = pool.begin().await?;

    let next = sqlx::query("SELECT COALESCE(MAX(host_id), 0) + 1 AS next FROM hosts")
        .fetch_one(&mut *tx)
        .await?
        .get::<i64, _>("next");

    let inserted = sqlx::query("INSERT INTO hosts (key_hash, host_id, created_at) VALUES (?, ?, ?)")
        .bind(key_hash)
        .bind(next)
        .bind(current_ts())
        .execute(&mut *tx)
        .await;

    match inserted {
        Ok(_) => {
            tx.commit().await?;
            Ok(HostId(next as u64))
        }
        Err(e) if is_unique_violation(&e) => {
            tx.rollback().await?;
            let existing = sqlx::query("SELECT host_id FROM hosts WHERE key_hash = ?")
                .bind(key_hash)
                .fetch_one(pool)
                .await?
                .get::<i64, _>("host_id");
            Ok(HostId(existing as u64))
        }
        Err(e) => {
            tx.rollback().await?;
            Err(e.into())
        }
    }
}

pub async fn count_hosts(pool: &SqlitePool) -> DbResult<i64> {
    let row = sqlx::query("SELECT COUNT(*) as cnt FROM hosts").fetch_one(pool).await?;
    Ok(row.get::<i64, _>("cnt"))
}
