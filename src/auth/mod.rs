//! Caller identity.
//!
//! A request is resolved to a profile by trying each [`Strategy`] in order; the first
//! one that yields an active profile wins. A strategy that finds nothing (no input,
//! unknown key, stale session) falls through to the next one. Only storage failures
//! abort resolution.

pub mod credentials;
pub mod sessions;

use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{profiles, AppResult, Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Possession of an issued secret.
    ApiKey,
    /// Continuity of a gateway-issued session previously bound by register/login.
    Session,
    /// Bare assertion of a profile id, for clients that can keep neither of the above.
    ProfileId,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        use Strategy::*;
        match self {
            ApiKey => "api_key",
            Session => "session",
            ProfileId => "profile_id",
        }
    }

    async fn attempt(self, db_pool: &SqlitePool, pepper: &str, inputs: &AuthInputs<'_>) -> AppResult<Option<String>> {
        use Strategy::*;
        match self {
            ApiKey => match inputs.api_key {
                Some(secret) => credentials::validate(db_pool, pepper, secret.trim()).await,
                None => Ok(None),
            },
            Session => match inputs.session_id {
                Some(session_id) => sessions::resolve(db_pool, session_id).await,
                None => Ok(None),
            },
            ProfileId => {
                let Some(profile_id) = inputs.profile_id.and_then(|raw| Uuid::parse_str(raw.trim()).ok()) else {
                    return Ok(None);
                };
                Ok(
                    profiles::find_active(db_pool, &profile_id.to_string())
                        .await?
                        .map(|profile| profile.id)
                )
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AuthInputs<'a> {
    pub api_key: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub profile_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub profile_id: String,
    pub via: Strategy,
}

#[derive(Debug, Clone)]
pub struct Authenticator {
    chain: Arc<[Strategy]>,
    pepper: Arc<str>,
}

impl Authenticator {
    pub fn new(chain: Vec<Strategy>, pepper: &str) -> Self {
        Authenticator {
            chain: chain.into(),
            pepper: pepper.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut chain = vec![Strategy::ApiKey, Strategy::Session];
        if config.allow_profile_id_auth {
            chain.push(Strategy::ProfileId);
        }
        Authenticator::new(chain, &config.credential_pepper)
    }

    pub fn chain(&self) -> &[Strategy] {
        &self.chain
    }

    pub fn pepper(&self) -> &str {
        &self.pepper
    }

    pub async fn resolve(&self, db_pool: &SqlitePool, inputs: &AuthInputs<'_>) -> AppResult<Option<Identity>> {
        for &strategy in self.chain.iter() {
            if let Some(profile_id) = strategy.attempt(db_pool, &self.pepper, inputs).await? {
                tracing::debug!(profile = %profile_id, via = strategy.name(), "caller resolved");
                return Ok(Some(Identity { profile_id, via: strategy }));
            }
        }
        Ok(None)
    }
}
