pub mod engine;
pub mod machine;

use std::fmt;

use serde::Serialize;
use sqlx::{SqliteExecutor, SqlitePool};

use crate::{db, intents::Intent, AppResult};

pub use engine::{Engine, Scorer, Verdict};
pub use machine::{Action, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MatchStatus {
    PendingA,
    PendingB,
    Accepted,
    Rejected,
    Expired,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        use MatchStatus::*;
        match self {
            PendingA => "pending_a",
            PendingB => "pending_b",
            Accepted => "accepted",
            Rejected => "rejected",
            Expired => "expired",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Match {
    pub id: String,
    pub intent_a_id: String,
    pub intent_b_id: String,
    pub profile_a_id: String,
    pub profile_b_id: String,
    pub score: f64,
    pub reason: String,
    pub status: MatchStatus,
    pub a_accepted_at: Option<i64>,
    pub b_accepted_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Match {
    pub fn side_of(&self, profile_id: &str) -> Option<Side> {
        if self.profile_a_id == profile_id {
            Some(Side::A)
        } else if self.profile_b_id == profile_id {
            Some(Side::B)
        } else {
            None
        }
    }

    pub fn profile(&self, side: Side) -> &str {
        match side {
            Side::A => &self.profile_a_id,
            Side::B => &self.profile_b_id,
        }
    }
}

/// A match with both parties' public details, as listed to one of them.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MatchListing {
    #[sqlx(flatten)]
    pub inner: Match,
    pub a_display_name: String,
    pub a_bio: String,
    pub b_display_name: String,
    pub b_bio: String,
}

const COLUMNS: &str = "id,intent_a_id,intent_b_id,profile_a_id,profile_b_id,score,reason,status,a_accepted_at,b_accepted_at,expires_at,created_at,updated_at";

pub async fn find(db_pool: &SqlitePool, match_id: &str) -> AppResult<Option<Match>> {
    Ok(
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM matches WHERE id=?"))
            .bind(match_id)
            .fetch_optional(db_pool)
            .await?
    )
}

pub async fn pair_exists(db_pool: &SqlitePool, x: &str, y: &str) -> AppResult<bool> {
    let found: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM matches WHERE (intent_a_id=? AND intent_b_id=?) OR (intent_a_id=? AND intent_b_id=?) LIMIT 1",
    )
        .bind(x)
        .bind(y)
        .bind(y)
        .bind(x)
        .fetch_optional(db_pool)
        .await?;
    Ok(found.is_some())
}

/// Creates a `pending_a` match between `a` and `b` unless the unordered pair was
/// already compared. Returns `None` when a match for the pair exists.
pub async fn insert_if_absent(
    db_pool: &SqlitePool,
    a: &Intent,
    b: &Intent,
    score: f64,
    reason: &str,
    expires_at: Option<i64>,
) -> AppResult<Option<Match>> {
    if a.profile_id == b.profile_id {
        return Ok(None);
    }

    let mut tx = db_pool.begin().await?;

    let existing: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM matches WHERE (intent_a_id=? AND intent_b_id=?) OR (intent_a_id=? AND intent_b_id=?) LIMIT 1",
    )
        .bind(&a.id)
        .bind(&b.id)
        .bind(&b.id)
        .bind(&a.id)
        .fetch_optional(&mut *tx)
        .await?;
    if existing.is_some() {
        return Ok(None);
    }

    let now = db::now();
    let created = Match {
        id: db::new_id(),
        intent_a_id: a.id.clone(),
        intent_b_id: b.id.clone(),
        profile_a_id: a.profile_id.clone(),
        profile_b_id: b.profile_id.clone(),
        score,
        reason: reason.to_owned(),
        status: MatchStatus::PendingA,
        a_accepted_at: None,
        b_accepted_at: None,
        expires_at,
        created_at: now,
        updated_at: now,
    };

    // the unique pair index settles races with a concurrent pass
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO matches (id,intent_a_id,intent_b_id,profile_a_id,profile_b_id,score,reason,status,expires_at,created_at,updated_at)
         VALUES (?,?,?,?,?,?,?,?,?,?,?)",
    )
        .bind(&created.id)
        .bind(&created.intent_a_id)
        .bind(&created.intent_b_id)
        .bind(&created.profile_a_id)
        .bind(&created.profile_b_id)
        .bind(created.score)
        .bind(&created.reason)
        .bind(created.status)
        .bind(created.expires_at)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    if inserted.rows_affected() == 0 {
        return Ok(None);
    }
    tracing::info!(match_id = %created.id, profile_a = %created.profile_a_id, profile_b = %created.profile_b_id, score, "match created");
    Ok(Some(created))
}

/// Compare-and-set of a match status. `accepted_by` stamps that side's acceptance time.
/// Returns false when the match was no longer in `from`.
pub async fn transition<'e>(
    executor: impl SqliteExecutor<'e>,
    match_id: &str,
    from: MatchStatus,
    to: MatchStatus,
    accepted_by: Option<Side>,
) -> AppResult<bool> {
    let now = db::now();
    let stamp = match accepted_by {
        Some(Side::A) => ", a_accepted_at=?2",
        Some(Side::B) => ", b_accepted_at=?2",
        None => "",
    };
    let result = sqlx::query(&format!("UPDATE matches SET status=?1, updated_at=?2{stamp} WHERE id=?3 AND status=?4"))
        .bind(to)
        .bind(now)
        .bind(match_id)
        .bind(from)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Matches involving `profile_id` that are still pending or accepted, newest first.
pub async fn visible_for(db_pool: &SqlitePool, profile_id: &str) -> AppResult<Vec<MatchListing>> {
    Ok(
        sqlx::query_as(
            "SELECT m.id,m.intent_a_id,m.intent_b_id,m.profile_a_id,m.profile_b_id,m.score,m.reason,m.status,
                    m.a_accepted_at,m.b_accepted_at,m.expires_at,m.created_at,m.updated_at,
                    pa.display_name AS a_display_name, pa.bio AS a_bio,
                    pb.display_name AS b_display_name, pb.bio AS b_bio
             FROM matches m
             JOIN profiles pa ON pa.id=m.profile_a_id
             JOIN profiles pb ON pb.id=m.profile_b_id
             WHERE (m.profile_a_id=? OR m.profile_b_id=?) AND m.status IN ('pending_a','pending_b','accepted')
             ORDER BY m.created_at DESC, m.id DESC",
        )
            .bind(profile_id)
            .bind(profile_id)
            .fetch_all(db_pool)
            .await?
    )
}

/// Matches whose next move belongs to `profile_id`.
pub async fn awaiting(db_pool: &SqlitePool, profile_id: &str) -> AppResult<Vec<Match>> {
    Ok(
        sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM matches
             WHERE (status='pending_a' AND profile_a_id=?) OR (status='pending_b' AND profile_b_id=?)
             ORDER BY created_at, id"
        ))
            .bind(profile_id)
            .bind(profile_id)
            .fetch_all(db_pool)
            .await?
    )
}

/// Moves every pending match past its expiry to `expired`. Returns how many moved.
pub async fn expire_overdue(db_pool: &SqlitePool, now: i64) -> AppResult<u64> {
    let result = sqlx::query(
        "UPDATE matches SET status='expired', updated_at=?
         WHERE status IN ('pending_a','pending_b') AND expires_at IS NOT NULL AND expires_at<=?",
    )
        .bind(now)
        .bind(now)
        .execute(db_pool)
        .await?;
    Ok(result.rows_affected())
}
