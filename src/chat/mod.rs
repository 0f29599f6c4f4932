use serde::Serialize;
use sqlx::{SqliteExecutor, SqlitePool};

use crate::{db, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    System,
    Intro,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Message {
    pub id: String,
    pub match_id: String,
    pub sender_profile_id: String,
    pub sender_name: String,
    pub content: String,
    pub message_type: MessageType,
    pub read_at: Option<i64>,
    pub created_at: i64,
}

/// Appends a message to a match's chat without any gate.
pub async fn post<'e>(
    executor: impl SqliteExecutor<'e>,
    match_id: &str,
    sender: &str,
    message_type: MessageType,
    content: &str,
) -> AppResult<String> {
    let id = db::new_id();
    sqlx::query("INSERT INTO messages (id,match_id,sender_profile_id,content,message_type,created_at) VALUES (?,?,?,?,?,?)")
        .bind(&id)
        .bind(match_id)
        .bind(sender)
        .bind(content)
        .bind(message_type)
        .bind(db::now())
        .execute(executor)
        .await?;
    Ok(id)
}

/// Sends a text message, but only into an accepted match the sender is party to.
/// The status check and the insert are one statement. Returns `None` when gated.
pub async fn send(db_pool: &SqlitePool, match_id: &str, sender: &str, content: &str) -> AppResult<Option<String>> {
    let id = db::new_id();
    let result = sqlx::query(
        "INSERT INTO messages (id,match_id,sender_profile_id,content,message_type,created_at)
         SELECT ?,?,?,?,'text',? WHERE EXISTS (
            SELECT 1 FROM matches WHERE id=? AND status='accepted' AND (profile_a_id=? OR profile_b_id=?)
         )",
    )
        .bind(&id)
        .bind(match_id)
        .bind(sender)
        .bind(content)
        .bind(db::now())
        .bind(match_id)
        .bind(sender)
        .bind(sender)
        .execute(db_pool)
        .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    tracing::info!(match_id, sender, message = %id, "message sent");
    Ok(Some(id))
}

/// The chat of a match in the order it was written.
pub async fn list(db_pool: &SqlitePool, match_id: &str) -> AppResult<Vec<Message>> {
    Ok(
        sqlx::query_as(
            "SELECT m.id,m.match_id,m.sender_profile_id,p.display_name AS sender_name,m.content,m.message_type,m.read_at,m.created_at
             FROM messages m JOIN profiles p ON p.id=m.sender_profile_id
             WHERE m.match_id=?
             ORDER BY m.created_at, m.rowid",
        )
            .bind(match_id)
            .fetch_all(db_pool)
            .await?
    )
}

/// Marks everything the other party wrote in this match as read by `reader`.
pub async fn mark_read(db_pool: &SqlitePool, match_id: &str, reader: &str) -> AppResult<u64> {
    let result = sqlx::query("UPDATE messages SET read_at=? WHERE match_id=? AND sender_profile_id<>? AND read_at IS NULL")
        .bind(db::now())
        .bind(match_id)
        .bind(reader)
        .execute(db_pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matches::{self, tests::two_intents, MatchStatus, Side};

    #[tokio::test]
    async fn messages_only_flow_once_accepted() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let (x, y) = two_intents(&db_pool).await;
        let m = matches::insert_if_absent(&db_pool, &x, &y, 0.6, "", None).await.unwrap().unwrap();

        assert!(send(&db_pool, &m.id, &x.profile_id, "hi").await.unwrap().is_none());
        matches::transition(&db_pool, &m.id, MatchStatus::PendingA, MatchStatus::PendingB, Some(Side::A)).await.unwrap();
        assert!(send(&db_pool, &m.id, &y.profile_id, "hi").await.unwrap().is_none());
        matches::transition(&db_pool, &m.id, MatchStatus::PendingB, MatchStatus::Accepted, Some(Side::B)).await.unwrap();

        assert!(send(&db_pool, &m.id, "stranger", "hi").await.unwrap().is_none());
        send(&db_pool, &m.id, &x.profile_id, "hi Sam").await.unwrap().unwrap();
        send(&db_pool, &m.id, &y.profile_id, "hey Alex").await.unwrap().unwrap();

        let chat = list(&db_pool, &m.id).await.unwrap();
        let lines: Vec<_> = chat.iter().map(|m| (m.sender_name.as_str(), m.content.as_str())).collect();
        assert_eq!(lines, vec![("Alex", "hi Sam"), ("Sam", "hey Alex")]);

        assert_eq!(mark_read(&db_pool, &m.id, &x.profile_id).await.unwrap(), 1);
        assert_eq!(mark_read(&db_pool, &m.id, &x.profile_id).await.unwrap(), 0);
    }
}
