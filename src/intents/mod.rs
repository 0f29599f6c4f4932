use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;

use crate::{db, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Category {
    Professional,
    Romance,
    Friendship,
    Expertise,
    Sports,
    Learning,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Professional,
        Category::Romance,
        Category::Friendship,
        Category::Expertise,
        Category::Sports,
        Category::Learning,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        use Category::*;
        match self {
            Professional => "professional",
            Romance => "romance",
            Friendship => "friendship",
            Expertise => "expertise",
            Sports => "sports",
            Learning => "learning",
            Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Intent {
    pub id: String,
    pub profile_id: String,
    pub category: Category,
    pub description: String,
    pub criteria: String,
    pub created_at: i64,
}

/// An intent together with the owner details the scorer gets to see.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IntentCard {
    #[sqlx(flatten)]
    pub intent: Intent,
    pub display_name: String,
    pub bio: String,
}

const CARD_SELECT: &str = "SELECT i.id,i.profile_id,i.category,i.description,i.criteria,i.created_at,p.display_name,p.bio
    FROM intents i JOIN profiles p ON p.id=i.profile_id
    WHERE i.is_active=1 AND p.is_active=1";

pub async fn create(
    db_pool: &SqlitePool,
    profile_id: &str,
    category: Category,
    description: &str,
    criteria: Option<&Value>,
) -> AppResult<Intent> {
    let now = db::now();
    let intent = Intent {
        id: db::new_id(),
        profile_id: profile_id.to_owned(),
        category,
        description: description.trim().to_owned(),
        criteria: criteria.map(Value::to_string).unwrap_or_else(|| "{}".to_owned()),
        created_at: now,
    };

    sqlx::query("INSERT INTO intents (id,profile_id,category,description,criteria,is_active,created_at,updated_at) VALUES (?,?,?,?,?,1,?,?)")
        .bind(&intent.id)
        .bind(&intent.profile_id)
        .bind(intent.category)
        .bind(&intent.description)
        .bind(&intent.criteria)
        .bind(now)
        .bind(now)
        .execute(db_pool)
        .await?;

    tracing::info!(profile = profile_id, intent = %intent.id, category = %category, "intent created");
    Ok(intent)
}

/// Retires one of `profile_id`'s own intents so it stops matching. Returns false when
/// the intent does not exist, belongs to someone else, or is already inactive.
pub async fn deactivate(db_pool: &SqlitePool, profile_id: &str, intent_id: &str) -> AppResult<bool> {
    let result = sqlx::query("UPDATE intents SET is_active=0, updated_at=? WHERE id=? AND profile_id=? AND is_active=1")
        .bind(db::now())
        .bind(intent_id)
        .bind(profile_id)
        .execute(db_pool)
        .await?;

    let deactivated = result.rows_affected() == 1;
    if deactivated {
        tracing::info!(profile = profile_id, intent = intent_id, "intent deactivated");
    }
    Ok(deactivated)
}

pub async fn active_for(db_pool: &SqlitePool, profile_id: &str) -> AppResult<Vec<Intent>> {
    Ok(
        sqlx::query_as(
            "SELECT id,profile_id,category,description,criteria,created_at FROM intents
             WHERE profile_id=? AND is_active=1
             ORDER BY created_at, id",
        )
            .bind(profile_id)
            .fetch_all(db_pool)
            .await?
    )
}

pub async fn active_cards_for(db_pool: &SqlitePool, profile_id: &str) -> AppResult<Vec<IntentCard>> {
    Ok(
        sqlx::query_as(&format!("{CARD_SELECT} AND i.profile_id=? ORDER BY i.created_at, i.id"))
            .bind(profile_id)
            .fetch_all(db_pool)
            .await?
    )
}

pub async fn card(db_pool: &SqlitePool, intent_id: &str) -> AppResult<Option<IntentCard>> {
    Ok(
        sqlx::query_as(&format!("{CARD_SELECT} AND i.id=?"))
            .bind(intent_id)
            .fetch_optional(db_pool)
            .await?
    )
}

/// Active intents of every other active profile, optionally restricted to one category.
pub async fn candidates(db_pool: &SqlitePool, exclude_profile: &str, category: Option<Category>) -> AppResult<Vec<IntentCard>> {
    Ok(
        sqlx::query_as(&format!(
            "{CARD_SELECT} AND i.profile_id<>? AND (? IS NULL OR i.category=?) ORDER BY i.created_at, i.id"
        ))
            .bind(exclude_profile)
            .bind(category)
            .bind(category)
            .fetch_all(db_pool)
            .await?
    )
}

pub async fn all_active(db_pool: &SqlitePool) -> AppResult<Vec<IntentCard>> {
    Ok(
        sqlx::query_as(&format!("{CARD_SELECT} ORDER BY i.created_at, i.id"))
            .fetch_all(db_pool)
            .await?
    )
}
