//! Configuration loading for keyrelay clients.
//!
//! Configuration is loaded from a TOML file. Every section is optional; a
//! minimal file only lists relays:
//!
//! ```toml
//! relays = ["wss://relay.example.com"]
//! ```

use crate::transport::WebSocketRelayConfig;
use keyrelay_core::BackoffPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for a keyrelay client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    /// Relay endpoints (`ws://` or `wss://`).
    #[serde(default)]
    pub relays: Vec<String>,
    /// Outbound rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Retry schedules.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Query behaviour.
    #[serde(default)]
    pub query: QueryConfig,
    /// Per-connection timeouts.
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per window (default: 20).
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,
    /// Window length in milliseconds (default: 1000).
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Minimum gap between requests in milliseconds (default: 50).
    #[serde(default = "default_min_spacing_ms")]
    pub min_spacing_ms: u64,
}

/// Retry configuration.
///
/// Unset fields in `[retry.publish]` and `[retry.query]` fall back to
/// `[retry.default]`, then to the built-in preset for that operation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RetryConfig {
    /// Overrides for publishing.
    #[serde(default)]
    pub publish: RetryPolicyConfig,
    /// Overrides for querying.
    #[serde(default)]
    pub query: RetryPolicyConfig,
    /// Shared overrides.
    #[serde(default)]
    pub default: RetryPolicyConfig,
}

/// One retry schedule. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RetryPolicyConfig {
    /// Total attempts including the first.
    pub max_attempts: Option<u32>,
    /// Ceiling of the first delay in milliseconds.
    pub starting_delay_ms: Option<u64>,
    /// Growth factor per attempt.
    pub multiplier: Option<f64>,
    /// Cap on any single delay in milliseconds.
    pub max_delay_ms: Option<u64>,
}

/// Query configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryConfig {
    /// Overall deadline for a pool query in milliseconds (default: 10000).
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
}

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransportConfig {
    /// WebSocket handshake timeout in milliseconds (default: 5000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Wait for `OK` or the next query frame in milliseconds (default: 10000).
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

// Default value functions
fn default_max_per_window() -> u32 {
    20
}

fn default_window_ms() -> u64 {
    1000
}

fn default_min_spacing_ms() -> u64 {
    50
}

fn default_query_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: default_max_per_window(),
            window_ms: default_window_ms(),
            min_spacing_ms: default_min_spacing_ms(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

impl RetryPolicyConfig {
    fn or(&self, fallback: &RetryPolicyConfig) -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_attempts: self.max_attempts.or(fallback.max_attempts),
            starting_delay_ms: self.starting_delay_ms.or(fallback.starting_delay_ms),
            multiplier: self.multiplier.or(fallback.multiplier),
            max_delay_ms: self.max_delay_ms.or(fallback.max_delay_ms),
        }
    }

    fn over(&self, preset: BackoffPolicy) -> BackoffPolicy {
        BackoffPolicy::new(
            self.max_attempts.unwrap_or(preset.max_attempts),
            self.starting_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(preset.starting_delay),
            self.multiplier.unwrap_or(preset.multiplier),
            self.max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(preset.max_delay),
        )
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "retry.{}.max_attempts must be at least 1",
                section
            )));
        }
        if let Some(multiplier) = self.multiplier {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "retry.{}.multiplier must be a finite number >= 1",
                    section
                )));
            }
        }
        Ok(())
    }
}

impl RetryConfig {
    /// Resolved publish schedule.
    pub fn publish_policy(&self) -> BackoffPolicy {
        self.publish
            .or(&self.default)
            .over(BackoffPolicy::interactive_publish())
    }

    /// Resolved query schedule.
    pub fn query_policy(&self) -> BackoffPolicy {
        self.query
            .or(&self.default)
            .over(BackoffPolicy::background_query())
    }
}

impl VaultConfig {
    /// Configuration with the given relays and default everything else.
    pub fn with_relays<I, S>(relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            relays: relays.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content, path.to_path_buf())
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, PathBuf::from("<string>"))
    }

    fn parse(content: &str, path: PathBuf) -> Result<Self, ConfigError> {
        let config: VaultConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError { path, source: e })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relays.is_empty() {
            return Err(ConfigError::Invalid("at least one relay is required".into()));
        }
        for relay in &self.relays {
            if !(relay.starts_with("ws://") || relay.starts_with("wss://")) {
                return Err(ConfigError::Invalid(format!(
                    "relay {} must use ws:// or wss://",
                    relay
                )));
            }
        }
        if self.rate_limit.max_per_window == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_per_window must be at least 1".into(),
            ));
        }
        if self.rate_limit.window_ms == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_ms must be positive".into()));
        }
        self.retry.publish.validate("publish")?;
        self.retry.query.validate("query")?;
        self.retry.default.validate("default")?;
        if self.query.timeout_ms == 0 {
            return Err(ConfigError::Invalid("query.timeout_ms must be positive".into()));
        }
        if self.transport.connect_timeout_ms == 0 || self.transport.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("transport timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Overall query deadline.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query.timeout_ms)
    }

    /// Timeouts for each WebSocket connection.
    pub fn transport_config(&self) -> WebSocketRelayConfig {
        WebSocketRelayConfig {
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            ack_timeout: Duration::from_millis(self.transport.ack_timeout_ms),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Parsed but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_sections_have_defaults() {
        let config = VaultConfig::default();
        assert_eq!(config.rate_limit.max_per_window, 20);
        assert_eq!(config.rate_limit.window_ms, 1000);
        assert_eq!(config.query.timeout_ms, 10_000);
        assert_eq!(config.transport.connect_timeout_ms, 5_000);
    }

    #[test]
    fn default_config_needs_relays() {
        let err = VaultConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(VaultConfig::with_relays(["wss://relay.test"]).validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
relays = ["wss://a.test", "wss://b.test"]

[rate_limit]
max_per_window = 5
window_ms = 2000
min_spacing_ms = 100

[retry.publish]
max_attempts = 2

[query]
timeout_ms = 3000

[transport]
ack_timeout_ms = 1500
"#;

        let config = VaultConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.relays, vec!["wss://a.test", "wss://b.test"]);
        assert_eq!(config.rate_limit.max_per_window, 5);
        assert_eq!(config.rate_limit.min_spacing_ms, 100);
        assert_eq!(config.retry.publish_policy().max_attempts, 2);
        assert_eq!(config.query_timeout(), Duration::from_secs(3));
        assert_eq!(
            config.transport_config().ack_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(
            config.transport_config().connect_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn config_missing_fields_use_defaults() {
        let toml = r#"
relays = ["ws://localhost:7777"]
[rate_limit]
[retry]
[query]
[transport]
"#;

        let config = VaultConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert_eq!(config.retry.publish_policy(), BackoffPolicy::interactive_publish());
        assert_eq!(config.retry.query_policy(), BackoffPolicy::background_query());
    }

    #[test]
    fn retry_sections_fall_back_to_default_section() {
        let toml = r#"
relays = ["wss://a.test"]

[retry.default]
max_attempts = 7
multiplier = 3.0

[retry.query]
max_attempts = 2
"#;

        let config = VaultConfig::from_toml_str(toml).unwrap();
        let publish = config.retry.publish_policy();
        let query = config.retry.query_policy();

        assert_eq!(publish.max_attempts, 7);
        assert_eq!(publish.multiplier, 3.0);
        assert_eq!(
            publish.starting_delay,
            BackoffPolicy::interactive_publish().starting_delay
        );
        assert_eq!(query.max_attempts, 2);
        assert_eq!(query.multiplier, 3.0);
    }

    #[test]
    fn rejects_unusable_values() {
        let cases = [
            "relays = []",
            r#"relays = ["https://a.test"]"#,
            "relays = [\"wss://a.test\"]\n[rate_limit]\nwindow_ms = 0",
            "relays = [\"wss://a.test\"]\n[rate_limit]\nmax_per_window = 0",
            "relays = [\"wss://a.test\"]\n[retry.publish]\nmax_attempts = 0",
            "relays = [\"wss://a.test\"]\n[retry.default]\nmultiplier = 0.5",
            "relays = [\"wss://a.test\"]\n[query]\ntimeout_ms = 0",
        ];
        for case in cases {
            let err = VaultConfig::from_toml_str(case).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{}: {}", case, err);
        }
    }

    #[test]
    fn parse_error_is_reported() {
        let err = VaultConfig::from_toml_str("relays = [").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "relays = [\"wss://relay.test\"]").unwrap();

        let config = VaultConfig::from_file(file.path()).unwrap();
        assert_eq!(config.relays, vec!["wss://relay.test"]);
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = VaultConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
