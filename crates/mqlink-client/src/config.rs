//! Client configuration types.
//!
//! A [`ClientConfig`] is usually built in code, but it can also be loaded
//! from:
//! - a TOML file (default: `mqlink.toml`)
//! - environment variables with the `MQLINK__` prefix (double underscore for nesting)
//! - in-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! ```toml
//! address = "${MQTT_HOST:-localhost}:1883"
//! client_id = "sensor-7"
//! keep_alive = 30
//! connect_timeout = 5
//!
//! [retry]
//! max_retries = 5
//! initial_interval = 2
//! max_interval = 60
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::error::{ClientError, Result};
use crate::inflight::RetryPolicy;
use crate::will::Will;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "mqlink.toml";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ClientError::Config(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Durations are written as (possibly fractional) seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(de::Error::custom(
                "duration must be a non-negative number of seconds",
            ));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote broker address (host:port).
    pub address: String,
    /// Client identifier. Empty lets the broker assign one.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<String>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Bound on socket connect and on the CONNACK wait.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// QoS 1/2 retransmission policy.
    pub retry: RetryPolicy,
    /// How often the retry task scans for due retransmissions.
    #[serde(with = "duration_secs")]
    pub retry_tick: Duration,
    /// Log filter used by programs that install a logger.
    pub log_level: String,
    /// Last Will, sent with the next CONNECT.
    #[serde(skip)]
    pub will: Option<Will>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            retry_tick: Duration::from_millis(500),
            log_level: "info".to_string(),
            will: None,
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the retransmission policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set how often due retransmissions are scanned for.
    pub fn retry_tick(mut self, tick: Duration) -> Self {
        self.retry_tick = tick;
        self
    }

    /// Set the Last Will.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults and `MQLINK__*` variables
    /// still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        if path.is_file() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content)?;
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ClientConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let substituted = substitute_env_vars(content)?;
        let cfg = config::Config::builder()
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            .build()?;
        let config: ClientConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(ClientError::Config("address must not be empty".to_string()));
        }
        if self.retry_tick.is_zero() {
            return Err(ClientError::Config("retry_tick must be positive".to_string()));
        }
        self.retry.validate().map_err(ClientError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.keep_alive, 60);
        assert!(config.clean_session);
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new("broker:1884")
            .client_id("dev-1")
            .credentials("user", "secret")
            .keep_alive(15)
            .clean_session(false)
            .connect_timeout(Duration::from_secs(3));

        assert_eq!(config.address, "broker:1884");
        assert_eq!(config.client_id, "dev-1");
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.keep_alive, 15);
        assert!(!config.clean_session);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
address = "127.0.0.1:1884"
client_id = "sensor-7"
keep_alive = 30
connect_timeout = 2.5
retry_tick = 0.25
log_level = "debug"

[retry]
max_retries = 3
initial_interval = 1
max_interval = 8
"#;
        let config = ClientConfig::parse(toml).unwrap();
        assert_eq!(config.address, "127.0.0.1:1884");
        assert_eq!(config.client_id, "sensor-7");
        assert_eq!(config.keep_alive, 30);
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.retry_tick, Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_interval, Duration::from_secs(1));
        assert_eq!(config.retry.max_interval, Duration::from_secs(8));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = ClientConfig::parse("client_id = \"only-id\"").unwrap();
        assert_eq!(config.client_id, "only-id");
        assert_eq!(config.address, "localhost:1883");
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn test_parse_rejects_zero_tick() {
        assert!(matches!(
            ClientConfig::parse("retry_tick = 0"),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_env_var_substitution_with_default() {
        std::env::remove_var("MQLINK_TEST_NONEXISTENT_VAR");
        let content = r#"address = "${MQLINK_TEST_NONEXISTENT_VAR:-10.0.0.1}:1883""#;
        let substituted = substitute_env_vars(content).unwrap();
        assert!(substituted.contains("10.0.0.1:1883"));
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("MQLINK_TEST_PORT", "1885");
        let substituted = substitute_env_vars("address = \"h:${MQLINK_TEST_PORT}\"").unwrap();
        assert!(substituted.contains("h:1885"));
        std::env::remove_var("MQLINK_TEST_PORT");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = ClientConfig::load("/nonexistent/mqlink.toml").unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
