use std::str::FromStr;

use sqlx::{sqlite::{SqliteConnectOptions, SqlitePoolOptions}, SqlitePool};
use time::OffsetDateTime;

use crate::AppResult;

// Timestamps are unix milliseconds (UTC) throughout.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    bio TEXT NOT NULL DEFAULT '',
    location TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_seen_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS profiles_display_name ON profiles (display_name COLLATE NOCASE);

CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    key_hash TEXT NOT NULL UNIQUE,
    profile_id TEXT NOT NULL REFERENCES profiles (id),
    name TEXT,
    scopes TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_used_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mcp_sessions (
    session_id TEXT PRIMARY KEY,
    profile_id TEXT NOT NULL REFERENCES profiles (id),
    last_used_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS mcp_sessions_profile ON mcp_sessions (profile_id);

CREATE TABLE IF NOT EXISTS intents (
    id TEXT PRIMARY KEY,
    profile_id TEXT NOT NULL REFERENCES profiles (id),
    category TEXT NOT NULL,
    description TEXT NOT NULL,
    criteria TEXT NOT NULL DEFAULT '{}',
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS intents_profile ON intents (profile_id, is_active);

CREATE TABLE IF NOT EXISTS matches (
    id TEXT PRIMARY KEY,
    intent_a_id TEXT NOT NULL REFERENCES intents (id),
    intent_b_id TEXT NOT NULL REFERENCES intents (id),
    profile_a_id TEXT NOT NULL REFERENCES profiles (id),
    profile_b_id TEXT NOT NULL REFERENCES profiles (id),
    score REAL NOT NULL,
    reason TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending_a',
    a_accepted_at INTEGER,
    b_accepted_at INTEGER,
    expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK (profile_a_id <> profile_b_id),
    CHECK (score >= 0.0 AND score <= 1.0)
);
CREATE UNIQUE INDEX IF NOT EXISTS matches_intent_pair
    ON matches (min(intent_a_id, intent_b_id), max(intent_a_id, intent_b_id));
CREATE INDEX IF NOT EXISTS matches_profile_a ON matches (profile_a_id, status);
CREATE INDEX IF NOT EXISTS matches_profile_b ON matches (profile_b_id, status);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    match_id TEXT NOT NULL REFERENCES matches (id),
    sender_profile_id TEXT NOT NULL REFERENCES profiles (id),
    content TEXT NOT NULL,
    message_type TEXT NOT NULL DEFAULT 'text',
    read_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_match ON messages (match_id, created_at);

CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    profile_id TEXT NOT NULL REFERENCES profiles (id),
    notification_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    is_delivered INTEGER NOT NULL DEFAULT 0,
    delivered_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS notifications_pending ON notifications (profile_id, is_delivered);
"#;

pub async fn connect(database_url: &str) -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect_with(options)
        .await?;
    init(&db_pool).await?;
    Ok(db_pool)
}

/// Single-connection in-memory database. Every connection to `:memory:` is its own
/// database, so the pool must never open a second one or let the first expire.
pub async fn connect_in_memory() -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?
        .foreign_keys(true);
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    init(&db_pool).await?;
    Ok(db_pool)
}

pub async fn init(db_pool: &SqlitePool) -> AppResult<()> {
    sqlx::raw_sql(SCHEMA).execute(db_pool).await?;
    Ok(())
}

pub fn now() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// `YYYY-MM-DD` for a stored timestamp.
pub fn format_date(millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .map(|dt| dt.date().to_string())
        .unwrap_or_else(|_| "unknown".to_owned())
}

pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
