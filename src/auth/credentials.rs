use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::{db, AppResult};

pub const KEY_PREFIX: &str = "smcp_";

pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("{KEY_PREFIX}{}", hex::encode(bytes))
}

/// Hex SHA-256 over the pepper and the secret. Only this digest is ever stored.
pub fn digest(pepper: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update([0u8]);
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Issues a fresh credential for `profile_id` and returns the plaintext secret.
pub async fn issue(db_pool: &SqlitePool, pepper: &str, profile_id: &str, name: &str) -> AppResult<String> {
    let secret = generate_secret();
    sqlx::query("INSERT INTO api_keys (id,key_hash,profile_id,name,scopes,is_active,created_at) VALUES (?,?,?,?,?,1,?)")
        .bind(db::new_id())
        .bind(digest(pepper, &secret))
        .bind(profile_id)
        .bind(name)
        .bind(serde_json::to_string(&["social"])?)
        .bind(db::now())
        .execute(db_pool)
        .await?;
    Ok(secret)
}

/// Resolves an active credential (owned by an active profile) to its profile id.
pub async fn validate(db_pool: &SqlitePool, pepper: &str, secret: &str) -> AppResult<Option<String>> {
    if !secret.starts_with(KEY_PREFIX) {
        return Ok(None);
    }

    let Some((key_id, profile_id)): Option<(String, String)> = sqlx::query_as(
        "SELECT k.id,k.profile_id FROM api_keys k
         JOIN profiles p ON p.id=k.profile_id
         WHERE k.key_hash=? AND k.is_active=1 AND p.is_active=1",
    )
        .bind(digest(pepper, secret))
        .fetch_optional(db_pool)
        .await?
    else {
        return Ok(None);
    };

    sqlx::query("UPDATE api_keys SET last_used_at=? WHERE id=?")
        .bind(db::now())
        .bind(&key_id)
        .execute(db_pool)
        .await?;
    Ok(Some(profile_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{self, NewProfile};

    #[test]
    fn secrets_are_prefixed_and_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert!(a.starts_with(KEY_PREFIX));
        assert_eq!(a.len(), KEY_PREFIX.len() + 64);
        assert_ne!(a, b);
    }

    #[test]
    fn digest_depends_on_pepper() {
        assert_ne!(digest("one", "smcp_x"), digest("two", "smcp_x"));
        assert_eq!(digest("one", "smcp_x"), digest("one", "smcp_x"));
    }

    #[tokio::test]
    async fn only_the_exact_secret_validates() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let profile_id = profiles::create(&db_pool, NewProfile {
            client_id: "mcp_1", display_name: "Alex", bio: "Engineer", location: None,
        }).await.unwrap().unwrap();

        let secret = issue(&db_pool, "pepper", &profile_id, "test").await.unwrap();

        let stored: Vec<(String,)> = sqlx::query_as("SELECT key_hash FROM api_keys")
            .fetch_all(&db_pool)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].0.contains(&secret[KEY_PREFIX.len()..]));

        assert_eq!(validate(&db_pool, "pepper", &secret).await.unwrap(), Some(profile_id));

        let mut near_miss = secret.clone();
        let last = near_miss.pop().unwrap();
        near_miss.push(if last == '0' { '1' } else { '0' });
        assert_eq!(validate(&db_pool, "pepper", &near_miss).await.unwrap(), None);
        assert_eq!(validate(&db_pool, "other pepper", &secret).await.unwrap(), None);
        assert_eq!(validate(&db_pool, "pepper", "").await.unwrap(), None);
    }
}
