pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod intents;
pub mod matches;
pub mod mcp;
pub mod notify;
pub mod profiles;
pub mod sweep;

use std::sync::Arc;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}};
use serde_json::Value;
use sqlx::SqlitePool;

pub use config::Config;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub config: Arc<Config>,
    pub auth: auth::Authenticator,
    pub engine: matches::Engine,
    pub hub: notify::Hub,
}

impl AppState {
    /// Builds the state from an already-initialised pool. The scorer is chosen from `config`.
    pub fn new(db_pool: SqlitePool, config: Config) -> AppResult<Self> {
        let config = Arc::new(config);
        let engine = matches::Engine::from_config(&config)?;
        Ok(AppState {
            auth: auth::Authenticator::from_config(&config),
            db_pool,
            config,
            engine,
            hub: notify::Hub::default(),
        })
    }

    pub fn with_engine(mut self, engine: matches::Engine) -> Self {
        self.engine = engine;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("expected {0}")]
    Missing(String),
    #[error("expected {0} to be a string")]
    NotString(String),
    #[error("expected {0} to be an object")]
    NotObject(String),
}

pub trait GetField {
    fn get_str_field(&self, field: &str) -> Result<&str, FieldError>;
    fn get_opt_str_field(&self, field: &str) -> Result<Option<&str>, FieldError>;
    fn get_obj_field(&self, field: &str) -> Result<&Value, FieldError>;
}

impl GetField for serde_json::Value {
    fn get_str_field(&self, field: &str) -> Result<&str, FieldError> {
        self.get_opt_str_field(field)?
            .ok_or_else(|| FieldError::Missing(field.to_owned()))
    }

    fn get_opt_str_field(&self, field: &str) -> Result<Option<&str>, FieldError> {
        match self.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(FieldError::NotString(field.to_owned())),
        }
    }

    /// An explicit `null` counts as missing.
    fn get_obj_field(&self, field: &str) -> Result<&Value, FieldError> {
        match self.get(field) {
            None | Some(Value::Null) => Err(FieldError::Missing(field.to_owned())),
            Some(value @ Value::Object(_)) => Ok(value),
            Some(_) => Err(FieldError::NotObject(field.to_owned())),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            self.0.to_string(),
        )
            .into_response()
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        Self(anyhow::Error::msg(err))
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        Self(anyhow::Error::msg(err.to_owned()))
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(anyhow::Error);
apperr_impl!(serde_json::Error);
apperr_impl!(sqlx::Error);
apperr_impl!(reqwest::Error);
apperr_impl!(config::ConfigError);

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn get_field_distinguishes_missing_and_mistyped() {
        let v = json!({ "name": "social_whoami", "count": 3, "arguments": {} });
        assert_eq!(v.get_str_field("name").unwrap(), "social_whoami");
        assert!(matches!(v.get_str_field("nope"), Err(FieldError::Missing(_))));
        assert!(matches!(v.get_str_field("count"), Err(FieldError::NotString(_))));
        assert_eq!(v.get_opt_str_field("nope").unwrap(), None);
        assert!(v.get_obj_field("arguments").is_ok());
        assert!(matches!(v.get_obj_field("name"), Err(FieldError::NotObject(_))));
        assert!(matches!(json!({ "arguments": null }).get_obj_field("arguments"), Err(FieldError::Missing(_))));
    }
}
