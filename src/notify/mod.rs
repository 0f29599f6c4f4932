pub mod hub;

use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{SqliteExecutor, SqlitePool};

use crate::{auth::sessions, db, AppResult};

pub use hub::{Hub, SinkGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NotificationKind {
    NewMatch,
    MatchRequest,
    MatchAccepted,
    NewMessage,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    pub profile_id: String,
    pub notification_type: NotificationKind,
    pub payload: String,
    pub created_at: i64,
}

impl Notification {
    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.payload).unwrap_or(Value::Null)
    }
}

/// JSON-RPC notification frame as pushed over an event stream.
pub fn frame(data: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "notifications/message",
        "params": {
            "level": "info",
            "logger": "social-mcp",
            "data": data,
        },
    })
}

/// A stored notification that may still need pushing.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub id: String,
    pub profile_id: String,
    pub kind: NotificationKind,
    pub payload: Value,
    pub created_at: i64,
}

/// Records a notification for `profile_id` and pushes it to any of the profile's live
/// streams. A pushed notification counts as delivered and will not be polled again.
pub async fn publish(
    db_pool: &SqlitePool,
    hub: &Hub,
    profile_id: &str,
    kind: NotificationKind,
    payload: Value,
) -> AppResult<()> {
    let recorded = record(db_pool, profile_id, kind, payload).await?;
    deliver(db_pool, hub, &recorded).await
}

/// Stores an undelivered notification. Takes any executor so it can join a transaction;
/// pushing waits for [`deliver`] once that transaction has committed.
pub async fn record<'e>(
    executor: impl SqliteExecutor<'e>,
    profile_id: &str,
    kind: NotificationKind,
    payload: Value,
) -> AppResult<Recorded> {
    let recorded = Recorded {
        id: db::new_id(),
        profile_id: profile_id.to_owned(),
        kind,
        payload,
        created_at: db::now(),
    };
    sqlx::query("INSERT INTO notifications (id,profile_id,notification_type,payload,is_delivered,created_at) VALUES (?,?,?,?,0,?)")
        .bind(&recorded.id)
        .bind(profile_id)
        .bind(kind)
        .bind(recorded.payload.to_string())
        .bind(recorded.created_at)
        .execute(executor)
        .await?;
    Ok(recorded)
}

/// Pushes a recorded notification to the recipient's live streams and marks it delivered
/// if any stream took it.
pub async fn deliver(db_pool: &SqlitePool, hub: &Hub, recorded: &Recorded) -> AppResult<()> {
    if hub.is_empty() {
        return Ok(());
    }

    let data = json!({
        "id": recorded.id,
        "type": recorded.kind,
        "payload": recorded.payload,
        "created_at": recorded.created_at,
    });
    let mut pushed = false;
    for session_id in sessions::sessions_of(db_pool, &recorded.profile_id).await? {
        pushed |= hub.push(&session_id, frame(data.clone()));
    }

    if pushed {
        sqlx::query("UPDATE notifications SET is_delivered=1, delivered_at=? WHERE id=? AND is_delivered=0")
            .bind(db::now())
            .bind(&recorded.id)
            .execute(db_pool)
            .await?;
        tracing::debug!(profile = %recorded.profile_id, notification = %recorded.id, "notification pushed");
    }
    Ok(())
}

/// Claims every undelivered notification of `profile_id`, oldest first.
pub async fn take_undelivered(db_pool: &SqlitePool, profile_id: &str) -> AppResult<Vec<Notification>> {
    let mut taken: Vec<Notification> = sqlx::query_as(
        "UPDATE notifications SET is_delivered=1, delivered_at=?
         WHERE profile_id=? AND is_delivered=0
         RETURNING id,profile_id,notification_type,payload,created_at",
    )
        .bind(db::now())
        .bind(profile_id)
        .fetch_all(db_pool)
        .await?;

    taken.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(taken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{self, NewProfile};

    async fn profile(db_pool: &SqlitePool) -> String {
        profiles::create(db_pool, NewProfile { client_id: "a", display_name: "A", bio: "", location: None })
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn polled_notifications_are_handed_out_once() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let hub = Hub::default();
        let a = profile(&db_pool).await;

        publish(&db_pool, &hub, &a, NotificationKind::NewMatch, json!({"match_id": "m1"})).await.unwrap();
        publish(&db_pool, &hub, &a, NotificationKind::NewMessage, json!({"match_id": "m1"})).await.unwrap();

        let first = take_undelivered(&db_pool, &a).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].notification_type, NotificationKind::NewMatch);
        assert_eq!(first[0].payload()["match_id"], "m1");
        assert!(take_undelivered(&db_pool, &a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pushed_notifications_are_not_polled_again() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let hub = Hub::default();
        let a = profile(&db_pool).await;
        sessions::bind(&db_pool, "s1", &a).await.unwrap();
        let (_guard, mut rx) = hub.attach("s1");

        publish(&db_pool, &hub, &a, NotificationKind::MatchAccepted, json!({"match_id": "m1"})).await.unwrap();

        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed["method"], "notifications/message");
        assert_eq!(pushed["params"]["data"]["type"], "match_accepted");
        assert!(take_undelivered(&db_pool, &a).await.unwrap().is_empty());
    }
}
