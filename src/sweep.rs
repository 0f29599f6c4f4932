use std::time::Duration;

use sqlx::SqlitePool;

use crate::{auth::sessions, db, matches, notify::Hub, AppResult, AppState};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_matches: u64,
    pub purged_sessions: u64,
}

/// One pass: expires overdue matches and drops session bindings that have been idle
/// longer than `idle_ttl`, unless their stream is still open.
pub async fn sweep_once(db_pool: &SqlitePool, hub: &Hub, idle_ttl: Duration, now: i64) -> AppResult<SweepReport> {
    let expired_matches = matches::expire_overdue(db_pool, now).await?;

    let cutoff = now.saturating_sub(i64::try_from(idle_ttl.as_millis()).unwrap_or(i64::MAX));
    let mut purged_sessions = 0;
    for session_id in sessions::idle_since(db_pool, cutoff).await? {
        if hub.is_attached(&session_id) {
            continue;
        }
        if sessions::unbind(db_pool, &session_id).await? {
            purged_sessions += 1;
        }
    }

    Ok(SweepReport { expired_matches, purged_sessions })
}

pub async fn run(state: AppState) {
    let mut interval = tokio::time::interval(state.config.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match sweep_once(&state.db_pool, &state.hub, state.config.session_idle_ttl, db::now()).await {
            Ok(report) if report != SweepReport::default() => {
                tracing::info!(expired = report.expired_matches, purged = report.purged_sessions, "sweep");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        matches::{tests::two_intents, MatchStatus},
        profiles::{self, NewProfile},
    };

    #[tokio::test]
    async fn idle_sessions_without_streams_are_purged() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let hub = Hub::default();
        let a = profiles::create(&db_pool, NewProfile { client_id: "a", display_name: "A", bio: "", location: None }).await.unwrap().unwrap();
        sessions::bind(&db_pool, "idle", &a).await.unwrap();
        sessions::bind(&db_pool, "streaming", &a).await.unwrap();
        let (_guard, _rx) = hub.attach("streaming");

        let later = db::now() + 10_000;
        let report = sweep_once(&db_pool, &hub, Duration::from_secs(1), later).await.unwrap();
        assert_eq!(report.purged_sessions, 1);
        assert_eq!(sessions::sessions_of(&db_pool, &a).await.unwrap(), vec!["streaming".to_owned()]);

        let report = sweep_once(&db_pool, &hub, Duration::from_secs(3600), later).await.unwrap();
        assert_eq!(report, SweepReport::default());

        // an idle window longer than the clock can express keeps everything
        let report = sweep_once(&db_pool, &hub, Duration::from_secs(u64::MAX), later).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn overdue_matches_expire() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let (x, y) = two_intents(&db_pool).await;
        let m = matches::insert_if_absent(&db_pool, &x, &y, 0.6, "", Some(db::now() - 1)).await.unwrap().unwrap();

        let report = sweep_once(&db_pool, &Hub::default(), Duration::from_secs(3600), db::now()).await.unwrap();
        assert_eq!(report.expired_matches, 1);
        assert_eq!(matches::find(&db_pool, &m.id).await.unwrap().unwrap().status, MatchStatus::Expired);
    }
}
