//! Two-sided consent for a match.
//!
//! `pending_a` waits on profile A, `pending_b` on profile B. Either party may reject
//! while the match is pending; acting on a terminal match changes nothing. The pure
//! transition table lives in [`step`]; [`respond`] applies it against storage with a
//! compare-and-set so that concurrent responses never both claim the same move.

use serde::Deserialize;
use serde_json::json;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::{
    chat::{self, MessageType},
    matches::{self, Match, MatchStatus},
    notify::{self, Hub, NotificationKind, Recorded},
    AppResult,
};

const MAX_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Move { to: MatchStatus, accepted_by: Option<Side> },
    /// The match is already settled.
    Settled(MatchStatus),
    /// It is the other party's turn.
    WaitingOn(Side),
}

pub fn step(status: MatchStatus, side: Side, action: Action) -> Step {
    use MatchStatus::*;
    match (status, side, action) {
        (Accepted | Rejected | Expired, _, _) => Step::Settled(status),
        (PendingA | PendingB, _, Action::Reject) => Step::Move { to: Rejected, accepted_by: None },
        (PendingA, Side::A, Action::Accept) => Step::Move { to: PendingB, accepted_by: Some(Side::A) },
        (PendingA, Side::B, Action::Accept) => Step::WaitingOn(Side::A),
        (PendingB, Side::B, Action::Accept) => Step::Move { to: Accepted, accepted_by: Some(Side::B) },
        (PendingB, Side::A, Action::Accept) => Step::WaitingOn(Side::B),
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    NotFound,
    NotParty,
    Moved { from: MatchStatus, to: MatchStatus, found: Match },
    Unchanged { found: Match, step: Step },
}

/// Applies `action` by `profile_id` to a match. A lost compare-and-set reloads the
/// match and reinterprets the action against the status that won.
pub async fn respond(
    db_pool: &SqlitePool,
    hub: &Hub,
    match_id: &str,
    profile_id: &str,
    action: Action,
) -> AppResult<Outcome> {
    for _ in 0..MAX_ATTEMPTS {
        let Some(found) = matches::find(db_pool, match_id).await? else {
            return Ok(Outcome::NotFound);
        };
        let Some(side) = found.side_of(profile_id) else {
            return Ok(Outcome::NotParty);
        };

        let (to, accepted_by) = match step(found.status, side, action) {
            Step::Move { to, accepted_by } => (to, accepted_by),
            step => return Ok(Outcome::Unchanged { found, step }),
        };

        let from = found.status;
        let mut tx = db_pool.begin().await?;
        if !matches::transition(&mut *tx, match_id, from, to, accepted_by).await? {
            tracing::debug!(match_id, profile = profile_id, %from, "status changed underneath, retrying");
            continue;
        }

        // the status change and its records commit together; pushes wait for the commit
        let found = Match { status: to, ..found };
        let recorded = on_transition(&mut tx, &found).await?;
        tx.commit().await?;
        tracing::info!(match_id, profile = profile_id, %from, %to, "match transitioned");

        for notification in &recorded {
            notify::deliver(db_pool, hub, notification).await?;
        }
        return Ok(Outcome::Moved { from, to, found });
    }

    Err(format!("match {match_id} kept changing while responding").into())
}

/// Writes the records a move into `m.status` owes and returns the notifications to push.
async fn on_transition(tx: &mut Transaction<'_, Sqlite>, m: &Match) -> AppResult<Vec<Recorded>> {
    let mut recorded = Vec::new();
    match m.status {
        MatchStatus::PendingB => {
            recorded.push(notify::record(&mut **tx, &m.profile_b_id, NotificationKind::MatchRequest, json!({
                "match_id": m.id,
                "reason": m.reason,
                "score": m.score,
            })).await?);
        }
        MatchStatus::Accepted => {
            chat::post(&mut **tx, &m.id, &m.profile_a_id, MessageType::Intro, &format!("You're connected! {}", m.reason)).await?;
            for (me, other) in [(&m.profile_a_id, &m.profile_b_id), (&m.profile_b_id, &m.profile_a_id)] {
                recorded.push(notify::record(&mut **tx, me, NotificationKind::MatchAccepted, json!({
                    "match_id": m.id,
                    "with_profile_id": other,
                })).await?);
            }
        }
        MatchStatus::PendingA | MatchStatus::Rejected | MatchStatus::Expired => {}
    }
    Ok(recorded)
}
