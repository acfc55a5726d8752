//! Configuration management for Gramcast
//!
//! Configuration lives in a TOML file. Every section is optional and falls
//! back to defaults, so a minimal file only needs the account id and a token
//! source:
//!
//! ```toml
//! [graph]
//! account_id = "17841400000000000"
//! token_file = "~/.config/gramcast/token"
//!
//! [polling]
//! delay = "5s"
//! max_attempts = 30
//! ```
//!
//! Durations are written in human form (`"500ms"`, `"5s"`, `"15m"`, `"7d"`).

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

const CONFIG_ENV: &str = "GRAMCAST_CONFIG";
const ACCOUNT_ENV: &str = "GRAMCAST_ACCOUNT_ID";
const TOKEN_ENV: &str = "GRAMCAST_ACCESS_TOKEN";

/// Serde adapter for durations written as humantime strings
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub graph: GraphConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub polling: PollingConfig,
    pub publishing: PublishingConfig,
    pub verifier: VerifierConfig,
    pub queue: QueueConfig,
}

/// Remote API endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub api_base_url: String,
    pub api_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Inline token; prefer `token_file` or the environment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://graph.facebook.com".to_string(),
            api_version: "v22.0".to_string(),
            account_id: None,
            access_token: None,
            token_file: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Retry budget for a single remote call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Per-endpoint cooldown tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(with = "duration_str")]
    pub base_delay: Duration,
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
    /// Error-free gap after which an endpoint's streak starts over
    #[serde(with = "duration_str")]
    pub reset_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15 * 60),
            reset_after: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    #[serde(with = "duration_str")]
    pub delay: Duration,
    pub max_attempts: u32,
    /// Video containers take longer to process
    pub reel_max_attempts: u32,
    /// Rate-limit pauses allowed per poll before the error is surfaced
    pub max_rate_limit_waits: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: 30,
            reel_max_attempts: 60,
            max_rate_limit_waits: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishingConfig {
    pub caption_limit: usize,
    /// Pause between carousel child creations
    #[serde(with = "duration_str")]
    pub child_delay: Duration,
    pub max_carousel_items: usize,
    pub share_to_feed: bool,
    /// Public URL prefix under which local media files are served
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_base_url: Option<String>,
    /// Case-insensitive terms that block a caption before any remote call
    pub blocked_terms: Vec<String>,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            caption_limit: 2200,
            child_delay: Duration::from_secs(2),
            max_carousel_items: 10,
            share_to_feed: true,
            media_base_url: None,
            blocked_terms: Vec::new(),
        }
    }
}

/// Tuning for ambiguous-failure reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    #[serde(with = "duration_str")]
    pub match_window: Duration,
    #[serde(with = "duration_str")]
    pub high_confidence_window: Duration,
    #[serde(with = "duration_str")]
    pub medium_confidence_window: Duration,
    /// Minimum confidence to treat a recent post as the published job
    pub threshold: f64,
    pub recent_limit: u32,
    pub check_attempts: u32,
    #[serde(with = "duration_str")]
    pub check_interval: Duration,
    /// How long recorded attempts are kept
    #[serde(with = "duration_str")]
    pub retention: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            match_window: Duration::from_secs(30 * 60),
            high_confidence_window: Duration::from_secs(5 * 60),
            medium_confidence_window: Duration::from_secs(15 * 60),
            threshold: 0.8,
            recent_limit: 30,
            check_attempts: 3,
            check_interval: Duration::from_secs(10),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_history: usize,
    /// Jobs untouched for longer than this are pruned
    #[serde(with = "duration_str")]
    pub retention: Duration,
    /// Local files under this directory are treated as owned temp media
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<String>,
    pub event_capacity: usize,
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_history: 100,
            retention: Duration::from_secs(24 * 3600),
            temp_dir: None,
            event_capacity: 100,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// Honors `GRAMCAST_CONFIG`. A missing file at the default location
    /// yields the default configuration; a missing file named through the
    /// environment is an error.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_ENV).is_ok();
        let config_path = resolve_config_path()?;

        let mut config = if !explicit && !config_path.exists() {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            Config::default()
        } else {
            Self::load_from_path(&config_path)?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Apply `GRAMCAST_ACCOUNT_ID` and `GRAMCAST_ACCESS_TOKEN`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(account_id) = std::env::var(ACCOUNT_ENV) {
            if !account_id.trim().is_empty() {
                self.graph.account_id = Some(account_id.trim().to_string());
            }
        }
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.trim().is_empty() {
                self.graph.access_token = Some(token.trim().to_string());
            }
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".to_string()).into());
        }
        if self.polling.max_attempts == 0 || self.polling.reel_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "polling attempt budgets must be at least 1".to_string(),
            )
            .into());
        }
        if !(self.verifier.threshold > 0.0 && self.verifier.threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "verifier.threshold must be in (0, 1], got {}",
                self.verifier.threshold
            ))
            .into());
        }
        if !(2..=10).contains(&self.publishing.max_carousel_items) {
            return Err(ConfigError::Invalid(format!(
                "publishing.max_carousel_items must be between 2 and 10, got {}",
                self.publishing.max_carousel_items
            ))
            .into());
        }
        if self.publishing.caption_limit < 4 {
            return Err(ConfigError::Invalid("publishing.caption_limit is too small".to_string()).into());
        }
        Ok(())
    }

    pub fn account_id(&self) -> Result<&str> {
        self.graph
            .account_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ConfigError::MissingField("graph.account_id".to_string()).into())
    }

    /// Resolve the access token: inline/env value first, then `token_file`
    pub fn access_token(&self) -> Result<SecretString> {
        if let Some(token) = self.graph.access_token.as_ref().filter(|t| !t.is_empty()) {
            return Ok(SecretString::from(token.clone()));
        }

        if let Some(file) = &self.graph.token_file {
            let path = PathBuf::from(shellexpand::tilde(file).to_string());
            let content = std::fs::read_to_string(&path).map_err(ConfigError::ReadError)?;
            let token = content.trim();
            if token.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "token file {} is empty",
                    path.display()
                ))
                .into());
            }
            return Ok(SecretString::from(token.to_string()));
        }

        Err(ConfigError::MissingField("graph.access_token or graph.token_file".to_string()).into())
    }

    /// Base URL including the API version, without a trailing slash
    pub fn api_root(&self) -> String {
        format!(
            "{}/{}",
            self.graph.api_base_url.trim_end_matches('/'),
            self.graph.api_version.trim_matches('/')
        )
    }

    pub fn temp_dir(&self) -> Option<PathBuf> {
        self.queue
            .temp_dir
            .as_ref()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).to_string()))
    }
}

/// Resolve the configuration file path following the XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("gramcast").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.polling.delay, Duration::from_secs(5));
        assert_eq!(config.polling.max_attempts, 30);
        assert_eq!(config.publishing.caption_limit, 2200);
        assert_eq!(config.queue.max_history, 100);
        assert_eq!(config.verifier.threshold, 0.8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file_with_durations() {
        let toml = r#"
            [graph]
            account_id = "1789"
            access_token = "tok"

            [polling]
            delay = "250ms"
            max_attempts = 4

            [verifier]
            retention = "2days"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.account_id().unwrap(), "1789");
        assert_eq!(config.polling.delay, Duration::from_millis(250));
        assert_eq!(config.polling.max_attempts, 4);
        assert_eq!(config.polling.reel_max_attempts, 60);
        assert_eq!(config.verifier.retention, Duration::from_secs(2 * 24 * 3600));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_invalid_duration_is_parse_error() {
        let toml = r#"
            [polling]
            delay = "soon"
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("delay = \"5s\""));
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.queue.retention, config.queue.retention);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.verifier.threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.publishing.max_carousel_items = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_account_id() {
        let config = Config::default();
        let err = config.account_id().unwrap_err();
        assert!(err.to_string().contains("graph.account_id"));
    }

    #[test]
    fn test_access_token_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  secret-token  ").unwrap();

        let mut config = Config::default();
        config.graph.token_file = Some(file.path().to_string_lossy().to_string());

        let token = config.access_token().unwrap();
        assert_eq!(token.expose_secret(), "secret-token");
    }

    #[test]
    fn test_inline_token_wins_over_file() {
        let mut config = Config::default();
        config.graph.access_token = Some("inline".to_string());
        config.graph.token_file = Some("/does/not/exist".to_string());
        assert_eq!(config.access_token().unwrap().expose_secret(), "inline");
    }

    #[test]
    fn test_missing_token() {
        assert!(Config::default().access_token().is_err());
    }

    #[test]
    fn test_api_root() {
        let mut config = Config::default();
        config.graph.api_base_url = "http://127.0.0.1:8080/".to_string();
        assert_eq!(config.api_root(), "http://127.0.0.1:8080/v22.0");
    }

    #[test]
    fn test_load_from_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nmax_history = 5").unwrap();
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.queue.max_history, 5);
    }
}
