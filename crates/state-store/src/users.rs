//! Directory user operations.
//!
//! Usernames are unique case-insensitively (enforced by the `COLLATE NOCASE`
//! unique index); lookups go through the same collation so a caller never has
//! to pre-fold. Writes are committed before the call returns.

use fv_types::user::User;
use sqlx::{Row, SqlitePool};

use crate::{current_ts, DbError, DbResult};

/// All users, ordered by entry id.
pub async fn user_list(pool: &SqlitePool) -> DbResult<Vec<User>> {
    let rows = sqlx::query("SELECT id, username, verifier, sessions, flags FROM users ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(map_user_row).collect())
}

/// Insert a new user. The `entry_id` field of the input is ignored; the
/// assigned id is returned. Duplicate usernames leave the table unchanged.
pub async fn add_user(pool: &SqlitePool, user: &User) -> DbResult<i64> {
    let result = sqlx::query("INSERT INTO users (username, verifier, sessions, flags, created_at) VALUES (?, ?, ?, ?, ?)")
        .bind(&user.username)
        .bind(&user.verifier)
        .bind(user.sessions as i64)
        .bind(user.flags as i64)
        .bind(current_ts())
        .execute(pool)
        .await;

    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => Err(DbError::DuplicateUsername {
            username: user.username.clone(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Overwrite an existing user row identified by `entry_id`.
pub async fn modify_user(pool: &SqlitePool, user: &User) -> DbResult<()> {
    let result = sqlx::query("UPDATE users SET username = ?, verifier = ?, sessions = ?, flags = ? WHERE id = ?")
        .bind(&user.username)
        .bind(&user.verifier)
        .bind(user.sessions as i64)
        .bind(user.flags as i64)
        .bind(user.entry_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::UserNotFound {
            entry_id: user.entry_id,
        });
    }
    Ok(())
}

pub async fn remove_user(pool: &SqlitePool, entry_id: i64) -> DbResult<()> {
    let result = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(entry_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::UserNotFound { entry_id });
    }
    Ok(())
}

/// Case-insensitive lookup by username.
pub async fn find_user(pool: &SqlitePool, username: &str) -> DbResult<Option<User>> {
    let row = sqlx::query("SELECT id, username, verifier, sessions, flags FROM users WHERE username = ? COLLATE NOCASE")
        .bind(username)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(map_user_row))
}

pub async fn count_users(pool: &SqlitePool) -> DbResult<i64> {
    let row = sqlx::query("SELECT COUNT(*) as cnt FROM users").fetch_one(pool).await?;
    Ok(row.get::<i64, _>("cnt"))
}

fn map_user_row(r: sqlx::sqlite::SqliteRow) -> User {
    User {
        entry_id: r.get("id"),
        username: r.get("username"),
        verifier: r.get("verifier"),
        sessions: r.get::<i64, _>("sessions") as u32,
        flags: r.get::<i64, _>("flags") as u32,
    }
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
