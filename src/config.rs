use std::{str::FromStr, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{0} must be between 0 and 1")]
    OutOfRange(&'static str),
}

/// OpenAI-compatible chat-completions endpoint used as the primary match scorer.
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    /// Base URL advertised in the SSE `endpoint` event. Falls back to the request's Host header.
    pub public_url: Option<String>,
    pub credential_pepper: String,
    pub allow_profile_id_auth: bool,
    /// Long-lived GET streams. When off, GET /mcp only hands back the endpoint pointer.
    pub streams: bool,
    pub global_find_matches: bool,
    pub match_threshold: f64,
    pub match_ttl: Option<Duration>,
    pub session_idle_ttl: Duration,
    pub sweep_interval: Duration,
    pub scorer: Option<ScorerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite://socialmcp.db?mode=rwc".to_owned(),
            bind_addr: "0.0.0.0:8080".to_owned(),
            public_url: None,
            credential_pepper: String::new(),
            allow_profile_id_auth: true,
            streams: true,
            global_find_matches: false,
            match_threshold: 0.3,
            match_ttl: Some(Duration::from_secs(168 * 3600)),
            session_idle_ttl: Duration::from_secs(30 * 24 * 3600),
            sweep_interval: Duration::from_secs(60),
            scorer: None,
        }
    }
}

impl Config {
    /// Reads the environment (and `.env`, if present) on top of the defaults.
    pub fn from_env() -> Result<Config, ConfigError> {
        dotenv::dotenv().ok();
        Config::from_lookup(|key| dotenv::var(key).ok())
    }

    /// Builds a config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let vars = Vars(lookup);
        let defaults = Config::default();

        let match_threshold = vars.parse("MATCH_THRESHOLD")?.unwrap_or(defaults.match_threshold);
        if !(0.0..=1.0).contains(&match_threshold) {
            return Err(ConfigError::OutOfRange("MATCH_THRESHOLD"));
        }

        // zero hours turns expiry off
        let match_ttl = match vars.duration("MATCH_TTL_HOURS", 3600)? {
            Some(ttl) if ttl.is_zero() => None,
            Some(ttl) => Some(ttl),
            None => defaults.match_ttl,
        };

        let scorer = vars.get("SCORER_URL").map(|url| ScorerConfig {
            url,
            api_key: vars.get("SCORER_API_KEY"),
            model: vars.get("SCORER_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_owned()),
        });

        Ok(Config {
            database_url: vars.get("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: vars.get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            public_url: vars.get("PUBLIC_URL").map(|url| url.trim_end_matches('/').to_owned()),
            credential_pepper: vars.get("CREDENTIAL_PEPPER").unwrap_or_default(),
            allow_profile_id_auth: vars.parse("ALLOW_PROFILE_ID_AUTH")?.unwrap_or(defaults.allow_profile_id_auth),
            streams: vars.parse("MCP_STREAMS")?.unwrap_or(defaults.streams),
            global_find_matches: vars.parse("GLOBAL_FIND_MATCHES")?.unwrap_or(defaults.global_find_matches),
            match_threshold,
            match_ttl,
            session_idle_ttl: vars.duration("SESSION_IDLE_DAYS", 24 * 3600)?.unwrap_or(defaults.session_idle_ttl),
            sweep_interval: vars.duration("SWEEP_INTERVAL_SECS", 1)?.unwrap_or(defaults.sweep_interval),
            scorer,
        })
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        value.trim().parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value })
    }

    /// A whole number of `unit_secs` units. Counts that overflow a second count are invalid.
    fn duration(&self, key: &'static str, unit_secs: u64) -> Result<Option<Duration>, ConfigError> {
        let Some(count) = self.parse::<u64>(key)? else {
            return Ok(None);
        };
        count.checked_mul(unit_secs)
            .map(|secs| Some(Duration::from_secs(secs)))
            .ok_or_else(|| ConfigError::Invalid { key, value: count.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = Config::default();
        assert!(!config.global_find_matches);
        assert!(config.allow_profile_id_auth);
        assert_eq!(config.match_threshold, 0.3);
        assert!(config.scorer.is_none());
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn values_override_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("MATCH_THRESHOLD", " 0.75 "),
            ("MATCH_TTL_HOURS", "2"),
            ("SESSION_IDLE_DAYS", "1"),
            ("MCP_STREAMS", "false"),
            ("PUBLIC_URL", "https://social.example/"),
            ("SCORER_URL", "https://llm.example/v1/chat/completions"),
            ("SCORER_MODEL", "  "),
        ]))
        .unwrap();
        assert_eq!(config.match_threshold, 0.75);
        assert_eq!(config.match_ttl, Some(Duration::from_secs(7200)));
        assert_eq!(config.session_idle_ttl, Duration::from_secs(86_400));
        assert!(!config.streams);
        assert_eq!(config.public_url.as_deref(), Some("https://social.example"));
        assert_eq!(config.scorer.unwrap().model, "gpt-4o-mini");
        assert_eq!(config.sweep_interval, Duration::from_secs(60));

        let config = Config::from_lookup(lookup(&[("MATCH_TTL_HOURS", "0")])).unwrap();
        assert_eq!(config.match_ttl, None);
    }

    #[test]
    fn unparseable_values_name_the_key() {
        let err = Config::from_lookup(lookup(&[("MCP_STREAMS", "yes please")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MCP_STREAMS", .. }));
        assert!(err.to_string().starts_with("MCP_STREAMS"));

        let err = Config::from_lookup(lookup(&[("MATCH_THRESHOLD", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MATCH_THRESHOLD", .. }));

        let err = Config::from_lookup(lookup(&[("SWEEP_INTERVAL_SECS", "-5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SWEEP_INTERVAL_SECS", .. }));
    }

    #[test]
    fn thresholds_outside_the_unit_interval_are_rejected() {
        for value in ["1.5", "-0.1", "NaN"] {
            let err = Config::from_lookup(lookup(&[("MATCH_THRESHOLD", value)])).unwrap_err();
            assert!(matches!(err, ConfigError::OutOfRange("MATCH_THRESHOLD")), "{value}");
        }
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let huge = u64::MAX.to_string();
        let err = Config::from_lookup(lookup(&[("MATCH_TTL_HOURS", huge.as_str())])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MATCH_TTL_HOURS", .. }));

        let err = Config::from_lookup(lookup(&[("SESSION_IDLE_DAYS", "999999999999999")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SESSION_IDLE_DAYS", .. }));
    }
}
