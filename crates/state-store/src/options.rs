//! Key-value router options (log level and the like).

use sqlx::{Row, SqlitePool};

use crate::DbResult;

pub async fn get_router_option(pool: &SqlitePool, key: &str) -> DbResult<Option<String>> {
    let row = sqlx::query("SELECT value FROM router_options WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<String, _>("value")))
}

pub async fn set_router_option(pool: &SqlitePool, key: &str, value: &str) -> DbResult<()> {
    sqlx::query("INSERT INTO router_options (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
    Ok(())
}
