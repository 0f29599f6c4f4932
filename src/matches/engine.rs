use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;

use crate::{
    config::ScorerConfig,
    db,
    intents::{self, IntentCard},
    matches::{self, Match},
    notify::{self, Hub, NotificationKind},
    AppResult, Config,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub score: f64,
    pub reason: String,
}

impl Verdict {
    fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.score)
    }
}

/// Compatibility of two intents. Implementations may fail; the engine falls back to
/// [`CategoryScorer`] whenever they do.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, a: &IntentCard, b: &IntentCard) -> AppResult<Verdict>;
}

/// Deterministic baseline: same category scores 0.6, anything else 0.
pub struct CategoryScorer;

impl CategoryScorer {
    pub fn verdict(a: &IntentCard, b: &IntentCard) -> Verdict {
        if a.intent.category == b.intent.category {
            Verdict {
                score: 0.6,
                reason: format!("Both looking for {} connections", a.intent.category),
            }
        } else {
            Verdict { score: 0.0, reason: "Different categories".to_owned() }
        }
    }
}

#[async_trait]
impl Scorer for CategoryScorer {
    async fn score(&self, a: &IntentCard, b: &IntentCard) -> AppResult<Verdict> {
        Ok(CategoryScorer::verdict(a, b))
    }
}

const SYSTEM_PROMPT: &str = "You are a matching algorithm for a social network. \
Analyze two user intents and decide whether they would be a good match.

Return a JSON object with:
- score: number between 0 and 1 (1 = perfect match)
- reason: one short sentence explaining why they match or don't

Consider complementary needs, shared interests, location compatibility and intent alignment.";

/// Scores through an OpenAI-compatible chat-completions endpoint.
pub struct LlmScorer {
    http_client: reqwest::Client,
    config: ScorerConfig,
}

#[derive(Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct RawVerdict {
    score: f64,
    #[serde(default)]
    reason: String,
}

impl LlmScorer {
    pub fn new(config: ScorerConfig) -> AppResult<Self> {
        let http_client = reqwest::ClientBuilder::new()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(LlmScorer { http_client, config })
    }

    fn describe(label: &str, card: &IntentCard) -> String {
        let bio = if card.bio.is_empty() { "No bio" } else { &card.bio };
        format!(
            "Intent {label}:\nCategory: {}\nDescription: {}\nCriteria: {}\nProfile: {}, {bio}",
            card.intent.category, card.intent.description, card.intent.criteria, card.display_name,
        )
    }
}

#[async_trait]
impl Scorer for LlmScorer {
    async fn score(&self, a: &IntentCard, b: &IntentCard) -> AppResult<Verdict> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": format!("{}\n\n{}\n\nAnalyze and return JSON.", Self::describe("A", a), Self::describe("B", b)),
                },
            ],
            "max_completion_tokens": 500,
            "response_format": { "type": "json_object" },
        });

        let mut request = self.http_client.post(&self.config.url).json(&body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let completion: Completion = request.send().await?
            .error_for_status()?
            .json()
            .await?;
        let content = completion.choices.into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or("scorer returned no content")?;

        let raw: RawVerdict = serde_json::from_str(&content)?;
        Ok(Verdict { score: raw.score, reason: raw.reason })
    }
}

/// A match the engine just created, from the point of view of the intent that drove it.
#[derive(Debug, Clone)]
pub struct Created {
    pub found: Match,
    pub counterpart_name: String,
    pub counterpart_intent: String,
}

/// `now + ttl` in ms, pinned to `i64::MAX` rather than wrapping.
fn expiry(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

#[derive(Clone)]
pub struct Engine {
    scorer: Arc<dyn Scorer>,
    threshold: f64,
    ttl: Option<Duration>,
}

impl Engine {
    pub fn new(scorer: Arc<dyn Scorer>, threshold: f64, ttl: Option<Duration>) -> Self {
        Engine { scorer, threshold, ttl }
    }

    pub fn from_config(config: &Config) -> AppResult<Self> {
        let scorer: Arc<dyn Scorer> = match &config.scorer {
            Some(scorer) => {
                tracing::info!(url = %scorer.url, model = %scorer.model, "using llm scorer");
                Arc::new(LlmScorer::new(scorer.clone())?)
            }
            None => Arc::new(CategoryScorer),
        };
        Ok(Engine::new(scorer, config.match_threshold, config.match_ttl))
    }

    /// Never fails: a scorer error or an unusable score falls back to the category baseline.
    pub async fn verdict(&self, a: &IntentCard, b: &IntentCard) -> Verdict {
        match self.scorer.score(a, b).await {
            Ok(verdict) if verdict.is_valid() => verdict,
            Ok(verdict) => {
                tracing::warn!(score = verdict.score, "scorer returned an out-of-range score, using category fallback");
                CategoryScorer::verdict(a, b)
            }
            Err(err) => {
                tracing::warn!(error = %err, "scorer failed, using category fallback");
                CategoryScorer::verdict(a, b)
            }
        }
    }

    async fn consider(&self, db_pool: &SqlitePool, hub: &Hub, a: &IntentCard, b: &IntentCard) -> AppResult<Option<Created>> {
        if a.intent.profile_id == b.intent.profile_id
            || matches::pair_exists(db_pool, &a.intent.id, &b.intent.id).await?
        {
            return Ok(None);
        }

        let verdict = self.verdict(a, b).await;
        tracing::debug!(intent_a = %a.intent.id, intent_b = %b.intent.id, score = verdict.score, "pair scored");
        if verdict.score < self.threshold {
            return Ok(None);
        }

        let expires_at = self.ttl.map(|ttl| expiry(db::now(), ttl));
        let Some(found) = matches::insert_if_absent(db_pool, &a.intent, &b.intent, verdict.score, &verdict.reason, expires_at).await? else {
            return Ok(None);
        };

        for (me, other) in [(a, b), (b, a)] {
            notify::publish(db_pool, hub, &me.intent.profile_id, NotificationKind::NewMatch, json!({
                "match_id": found.id,
                "with": other.display_name,
                "their_intent": other.intent.description,
                "score": found.score,
                "reason": found.reason,
            })).await?;
        }

        Ok(Some(Created {
            found,
            counterpart_name: b.display_name.clone(),
            counterpart_intent: b.intent.description.clone(),
        }))
    }

    async fn run_against(&self, db_pool: &SqlitePool, hub: &Hub, card: &IntentCard, pool: &[IntentCard]) -> AppResult<Vec<Created>> {
        let mut created = Vec::new();
        for candidate in pool {
            if let Some(new) = self.consider(db_pool, hub, card, candidate).await? {
                created.push(new);
            }
        }
        Ok(created)
    }

    /// Matches one freshly created intent against same-category intents of other profiles.
    pub async fn run_for_intent(&self, db_pool: &SqlitePool, hub: &Hub, intent_id: &str) -> AppResult<Vec<Created>> {
        let Some(card) = intents::card(db_pool, intent_id).await? else {
            return Ok(Vec::new());
        };
        let pool = intents::candidates(db_pool, &card.intent.profile_id, Some(card.intent.category)).await?;
        self.run_against(db_pool, hub, &card, &pool).await
    }

    /// Matches every active intent of `profile_id` against all other profiles' intents.
    pub async fn run_for_profile(&self, db_pool: &SqlitePool, hub: &Hub, profile_id: &str) -> AppResult<Vec<Created>> {
        let pool = intents::candidates(db_pool, profile_id, None).await?;
        let mut created = Vec::new();
        for card in intents::active_cards_for(db_pool, profile_id).await? {
            created.extend(self.run_against(db_pool, hub, &card, &pool).await?);
        }
        tracing::info!(profile = profile_id, created = created.len(), "profile match pass done");
        Ok(created)
    }

    /// Pairwise pass over every active intent.
    pub async fn run_global(&self, db_pool: &SqlitePool, hub: &Hub) -> AppResult<Vec<Created>> {
        let all = intents::all_active(db_pool).await?;
        let mut created = Vec::new();
        for (i, card) in all.iter().enumerate() {
            created.extend(self.run_against(db_pool, hub, card, &all[i + 1..]).await?);
        }
        tracing::info!(intents = all.len(), created = created.len(), "global match pass done");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        intents::Category,
        matches::MatchStatus,
        profiles::{self, NewProfile},
    };

    #[test]
    fn expiry_saturates() {
        assert_eq!(expiry(1_000, Duration::from_secs(2)), 3_000);
        assert_eq!(expiry(db::now(), Duration::from_secs(u64::MAX)), i64::MAX);
        assert_eq!(expiry(i64::MAX - 1, Duration::from_secs(3600)), i64::MAX);
    }

    struct Fixed(f64);

    #[async_trait]
    impl Scorer for Fixed {
        async fn score(&self, _: &IntentCard, _: &IntentCard) -> AppResult<Verdict> {
            Ok(Verdict { score: self.0, reason: "fixed".to_owned() })
        }
    }

    struct Broken;

    #[async_trait]
    impl Scorer for Broken {
        async fn score(&self, _: &IntentCard, _: &IntentCard) -> AppResult<Verdict> {
            Err("scorer offline".into())
        }
    }

    fn engine(scorer: impl Scorer + 'static) -> Engine {
        Engine::new(Arc::new(scorer), 0.3, None)
    }

    async fn profile(db_pool: &SqlitePool, name: &str) -> String {
        profiles::create(db_pool, NewProfile { client_id: name, display_name: name, bio: "", location: None })
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn unusable_scores_fall_back_to_category() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let a = profile(&db_pool, "A").await;
        let b = profile(&db_pool, "B").await;
        let x = intents::create(&db_pool, &a, Category::Sports, "tennis", None).await.unwrap();
        let y = intents::create(&db_pool, &b, Category::Sports, "squash", None).await.unwrap();
        let x = intents::card(&db_pool, &x.id).await.unwrap().unwrap();
        let y = intents::card(&db_pool, &y.id).await.unwrap().unwrap();

        let expected = Verdict { score: 0.6, reason: "Both looking for sports connections".to_owned() };
        assert_eq!(engine(Broken).verdict(&x, &y).await, expected);
        assert_eq!(engine(Fixed(1.7)).verdict(&x, &y).await, expected);
        assert_eq!(engine(Fixed(f64::NAN)).verdict(&x, &y).await, expected);
        assert_eq!(engine(Fixed(0.9)).verdict(&x, &y).await.score, 0.9);
    }

    #[tokio::test]
    async fn intent_pass_stays_in_category_and_is_idempotent() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let hub = Hub::default();
        let a = profile(&db_pool, "A").await;
        let b = profile(&db_pool, "B").await;
        intents::create(&db_pool, &b, Category::Friendship, "coffee", None).await.unwrap();
        intents::create(&db_pool, &b, Category::Learning, "guitar", None).await.unwrap();
        let mine = intents::create(&db_pool, &a, Category::Friendship, "walks", None).await.unwrap();

        let engine = engine(CategoryScorer);
        let created = engine.run_for_intent(&db_pool, &hub, &mine.id).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].counterpart_name, "B");
        assert_eq!(created[0].found.status, MatchStatus::PendingA);
        assert_eq!(created[0].found.profile_a_id, a);

        assert!(engine.run_for_intent(&db_pool, &hub, &mine.id).await.unwrap().is_empty());
        assert!(engine.run_for_profile(&db_pool, &hub, &b).await.unwrap().is_empty());

        let for_b = notify::take_undelivered(&db_pool, &b).await.unwrap();
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].notification_type, NotificationKind::NewMatch);
    }

    #[tokio::test]
    async fn threshold_and_scope() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let hub = Hub::default();
        let a = profile(&db_pool, "A").await;
        let b = profile(&db_pool, "B").await;
        let c = profile(&db_pool, "C").await;
        intents::create(&db_pool, &a, Category::Professional, "cofounder", None).await.unwrap();
        intents::create(&db_pool, &b, Category::Expertise, "rust mentor", None).await.unwrap();
        intents::create(&db_pool, &c, Category::Sports, "climbing", None).await.unwrap();

        assert!(engine(Fixed(0.29)).run_for_profile(&db_pool, &hub, &a).await.unwrap().is_empty());

        let created = engine(Fixed(0.3)).run_for_profile(&db_pool, &hub, &a).await.unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|m| m.found.profile_a_id == a));

        // only the b-c pair is left uncompared
        let created = engine(Fixed(0.8)).run_global(&db_pool, &hub).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].found.profile_a_id, b);
        assert_eq!(created[0].found.profile_b_id, c);
    }

    #[tokio::test]
    async fn matches_carry_an_expiry_when_configured() {
        let db_pool = db::connect_in_memory().await.unwrap();
        let hub = Hub::default();
        let a = profile(&db_pool, "A").await;
        let b = profile(&db_pool, "B").await;
        intents::create(&db_pool, &b, Category::Other, "chess", None).await.unwrap();
        intents::create(&db_pool, &a, Category::Other, "chess", None).await.unwrap();

        let engine = Engine::new(Arc::new(CategoryScorer), 0.3, Some(Duration::from_secs(3600)));
        let created = engine.run_for_profile(&db_pool, &hub, &a).await.unwrap();
        let expires_at = created[0].found.expires_at.unwrap();
        assert!(expires_at > db::now() + 3_500_000);
    }
}
