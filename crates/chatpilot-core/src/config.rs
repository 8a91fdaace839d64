//! Hub and client configuration.
//!
//! Every knob the core consumes is passed in explicitly through these
//! structs. Files are TOML; missing fields take their defaults.

use std::{net::SocketAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_backoff_ms.saturating_mul(1 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

/// Fuzzy contact matching policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPolicy {
    /// Minimum score (0..=1) an entry needs to be accepted.
    pub min_confidence: f64,
    /// Entries scoring within this distance of the best one count as a tie.
    pub tie_margin: f64,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            min_confidence: 0.6,
            tie_margin: 0.05,
        }
    }
}

impl MatchPolicy {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_confidence > 0.0 && self.min_confidence <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "min_confidence must be in (0, 1], got {}",
                self.min_confidence
            )));
        }
        if !(0.0..1.0).contains(&self.tie_margin) {
            return Err(ConfigError::Invalid(format!(
                "tie_margin must be in [0, 1), got {}",
                self.tie_margin
            )));
        }
        Ok(())
    }
}

/// Hub (coordinator) configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the websocket server binds to.
    pub listen_addr: SocketAddr,
    /// Deadline for a dispatched intent, retries included.
    pub request_timeout_ms: u64,
    /// Deadline for a language model call.
    pub model_timeout_ms: u64,
    /// Silence after which a connection is considered dead.
    pub idle_timeout_ms: u64,
    /// Backend retry policy.
    pub retry: RetryPolicy,
    /// Fuzzy contact matching.
    pub matching: MatchPolicy,
    /// Contacts included in `contact_list_broadcast`.
    pub broadcast_contact_limit: usize,
    /// Contacts included in the language model context snippet.
    pub context_contact_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8002)),
            request_timeout_ms: 10_000,
            model_timeout_ms: 5_000,
            idle_timeout_ms: 90_000,
            retry: RetryPolicy::default(),
            matching: MatchPolicy::default(),
            broadcast_contact_limit: 20,
            context_contact_limit: 20,
        }
    }
}

impl HubConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML or fails validation.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!("Loaded hub config from {}", path.display());
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 || self.model_timeout_ms == 0 || self.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        self.matching.validate()
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Client-side fallback configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Websocket URL of the hub.
    pub hub_url: String,
    /// Name declared in the registration handshake.
    pub client_name: String,
    /// Reconnection budget and backoff schedule.
    pub reconnect: RetryPolicy,
    /// How often a degraded client checks whether the hub is back.
    pub recheck_interval_ms: u64,
    /// How often a connected client pings the hub.
    pub keepalive_interval_ms: u64,
    /// Deadline for a single hub request.
    pub request_timeout_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:8002/ws".to_string(),
            client_name: "chatpilot_client".to_string(),
            reconnect: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 500,
                max_backoff_ms: 5_000,
            },
            recheck_interval_ms: 15_000,
            keepalive_interval_ms: 30_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl FallbackConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML or the budget is zero.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        if config.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.max_attempts must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    #[must_use]
    pub const fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }

    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = HubConfig::from_toml_str("").unwrap();
        assert_eq!(config, HubConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = HubConfig::from_toml_str(
            r#"
            listen_addr = "0.0.0.0:9000"
            request_timeout_ms = 250

            [matching]
            tie_margin = 0.1
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert!((config.matching.tie_margin - 0.1).abs() < f64::EPSILON);
        assert!((config.matching.min_confidence - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejects_bad_policy() {
        let err = HubConfig::from_toml_str("[matching]\nmin_confidence = 0.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = HubConfig::from_toml_str("[retry]\nmax_attempts = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }
}
