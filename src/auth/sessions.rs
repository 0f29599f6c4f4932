use sqlx::SqlitePool;

use crate::{db, AppResult};

const MAX_SESSION_ID_LEN: usize = 128;

pub fn new_session_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// Client-supplied ids end up in response headers, so only printable ASCII is kept.
pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id.bytes().all(|b| b.is_ascii_graphic())
}

pub async fn bind(db_pool: &SqlitePool, session_id: &str, profile_id: &str) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO mcp_sessions (session_id,profile_id,last_used_at) VALUES (?,?,?)
         ON CONFLICT (session_id) DO UPDATE SET profile_id=excluded.profile_id, last_used_at=excluded.last_used_at",
    )
        .bind(session_id)
        .bind(profile_id)
        .bind(db::now())
        .execute(db_pool)
        .await?;
    tracing::debug!(session = session_id, profile = profile_id, "session bound");
    Ok(())
}

/// Resolves a bound session to an active profile and refreshes its last-used time.
pub async fn resolve(db_pool: &SqlitePool, session_id: &str) -> AppResult<Option<String>> {
    let profile_id: Option<(String,)> = sqlx::query_as(
        "UPDATE mcp_sessions SET last_used_at=?
         WHERE session_id=? AND profile_id IN (SELECT id FROM profiles WHERE is_active=1)
         RETURNING profile_id",
    )
        .bind(db::now())
        .bind(session_id)
        .fetch_optional(db_pool)
        .await?;
    Ok(profile_id.map(|(id,)| id))
}

pub async fn unbind(db_pool: &SqlitePool, session_id: &str) -> AppResult<bool> {
    let result = sqlx::query("DELETE FROM mcp_sessions WHERE session_id=?")
        .bind(session_id)
        .execute(db_pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn sessions_of(db_pool: &SqlitePool, profile_id: &str) -> AppResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT session_id FROM mcp_sessions WHERE profile_id=?")
        .bind(profile_id)
        .fetch_all(db_pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn idle_since(db_pool: &SqlitePool, cutoff: i64) -> AppResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT session_id FROM mcp_sessions WHERE last_used_at<?")
        .bind(cutoff)
        .fetch_all(db_pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
