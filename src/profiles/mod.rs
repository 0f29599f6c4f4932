use sqlx::SqlitePool;

use crate::{db, AppResult};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Profile {
    pub id: String,
    pub client_id: String,
    pub display_name: String,
    pub bio: String,
    pub location: Option<String>,
    pub is_active: bool,
    pub last_seen_at: Option<i64>,
    pub created_at: i64,
}

const COLUMNS: &str = "id,client_id,display_name,bio,location,is_active,last_seen_at,created_at";

pub struct NewProfile<'a> {
    pub client_id: &'a str,
    pub display_name: &'a str,
    pub bio: &'a str,
    pub location: Option<&'a str>,
}

/// Inserts a profile under a client id nobody holds yet. Returns `None` when the
/// client id is already taken.
pub async fn create(db_pool: &SqlitePool, profile: NewProfile<'_>) -> AppResult<Option<String>> {
    let now = db::now();
    let created: Option<(String,)> = sqlx::query_as(
        "INSERT INTO profiles (id,client_id,display_name,bio,location,is_active,last_seen_at,created_at,updated_at)
         VALUES (?,?,?,?,?,1,?,?,?)
         ON CONFLICT (client_id) DO NOTHING
         RETURNING id",
    )
        .bind(db::new_id())
        .bind(profile.client_id)
        .bind(profile.display_name)
        .bind(profile.bio)
        .bind(profile.location)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(db_pool)
        .await?;

    let Some((profile_id,)) = created else {
        tracing::debug!(client_id = profile.client_id, "client id already registered");
        return Ok(None);
    };
    tracing::info!(profile = %profile_id, client_id = profile.client_id, "profile created");
    Ok(Some(profile_id))
}

/// Rewrites the public details of an existing profile and reactivates it. The client
/// id is left alone.
pub async fn update(db_pool: &SqlitePool, profile_id: &str, profile: NewProfile<'_>) -> AppResult<bool> {
    let now = db::now();
    let result = sqlx::query(
        "UPDATE profiles SET display_name=?, bio=?, location=?, is_active=1, last_seen_at=?, updated_at=?
         WHERE id=?",
    )
        .bind(profile.display_name)
        .bind(profile.bio)
        .bind(profile.location)
        .bind(now)
        .bind(now)
        .bind(profile_id)
        .execute(db_pool)
        .await?;
    tracing::info!(profile = profile_id, "profile updated");
    Ok(result.rows_affected() == 1)
}

pub async fn find_by_client_id(db_pool: &SqlitePool, client_id: &str) -> AppResult<Option<Profile>> {
    Ok(
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM profiles WHERE client_id=?"))
            .bind(client_id)
            .fetch_optional(db_pool)
            .await?
    )
}

pub async fn find(db_pool: &SqlitePool, profile_id: &str) -> AppResult<Option<Profile>> {
    Ok(
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM profiles WHERE id=?"))
            .bind(profile_id)
            .fetch_optional(db_pool)
            .await?
    )
}

pub async fn find_active(db_pool: &SqlitePool, profile_id: &str) -> AppResult<Option<Profile>> {
    Ok(find(db_pool, profile_id).await?.filter(|p| p.is_active))
}

/// Case-insensitive lookup; the most recently created profile wins when names collide.
pub async fn find_by_display_name(db_pool: &SqlitePool, display_name: &str) -> AppResult<Option<Profile>> {
    Ok(
        sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM profiles
             WHERE display_name=? COLLATE NOCASE AND is_active=1
             ORDER BY created_at DESC, id DESC
             LIMIT 1"
        ))
            .bind(display_name.trim())
            .fetch_optional(db_pool)
            .await?
    )
}

pub async fn touch(db_pool: &SqlitePool, profile_id: &str) -> AppResult<()> {
    sqlx::query("UPDATE profiles SET last_seen_at=? WHERE id=?")
        .bind(db::now())
        .bind(profile_id)
        .execute(db_pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alex(client_id: &str) -> NewProfile<'_> {
        NewProfile { client_id, display_name: "Alex", bio: "Engineer", location: None }
    }

    #[tokio::test]
    async fn client_ids_are_claimed_once() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let first = create(&db_pool, alex("mcp_1")).await.unwrap().unwrap();
        assert!(create(&db_pool, NewProfile { bio: "Impostor", ..alex("mcp_1") }).await.unwrap().is_none());
        assert_eq!(find(&db_pool, &first).await.unwrap().unwrap().bio, "Engineer");

        assert!(update(&db_pool, &first, NewProfile { bio: "Staff engineer", ..alex("ignored") }).await.unwrap());
        let updated = find_by_client_id(&db_pool, "mcp_1").await.unwrap().unwrap();
        assert_eq!(updated.id, first);
        assert_eq!(updated.bio, "Staff engineer");
        assert!(find_by_client_id(&db_pool, "ignored").await.unwrap().is_none());

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM profiles")
            .fetch_one(&db_pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn display_name_lookup_ignores_case_and_prefers_newest() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let older = create(&db_pool, alex("mcp_1")).await.unwrap().unwrap();
        let newer = create(&db_pool, alex("mcp_2")).await.unwrap().unwrap();
        assert_ne!(older, newer);
        sqlx::query("UPDATE profiles SET created_at=created_at-1000 WHERE id=?")
            .bind(&older)
            .execute(&db_pool)
            .await
            .unwrap();

        let found = find_by_display_name(&db_pool, "aLEX").await.unwrap().unwrap();
        assert_eq!(found.id, newer);
        assert!(find_by_display_name(&db_pool, "Sam").await.unwrap().is_none());
    }
}
