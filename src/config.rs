//! Client configuration.
//!
//! Every field has a default, so a config file only needs to name what it changes:
//!
//! ```rust
//! use vetcare_net::ClientConfig;
//!
//! let cfg = ClientConfig::from_json_str(r#"{ "base_url": "https://clinic.example/api",
//!                                            "retry": { "max_attempts": 5 } }"#).unwrap();
//! assert_eq!(cfg.retry.max_attempts, 5);
//! assert_eq!(cfg.retry.base_delay_ms, 1_000);
//! assert_eq!(cfg.auth.refresh, "/auth/refresh");
//! ```

use crate::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_API_URL: &str = "VETCARE_API_URL";
pub const ENV_RETRY_MAX: &str = "VETCARE_RETRY_MAX";
pub const ENV_RETRY_BASE_MS: &str = "VETCARE_RETRY_BASE_MS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Paths of the token endpoints. Requests whose path contains one of these never get a bearer
/// token attached, never trigger a refresh and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthEndpoints {
    pub login: String,
    pub register: String,
    pub refresh: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login".to_owned(),
            register: "/auth/register".to_owned(),
            refresh: "/auth/refresh".to_owned(),
        }
    }
}

impl AuthEndpoints {
    pub fn is_auth(&self, path: &str) -> bool {
        path.contains(&self.login) || path.contains(&self.register) || path.contains(&self.refresh)
    }

    pub fn is_refresh(&self, path: &str) -> bool {
        path.contains(&self.refresh)
    }

    /// Login or register, where a 401 means bad credentials rather than an expired session.
    pub fn is_credential_exchange(&self, path: &str) -> bool {
        path.contains(&self.login) || path.contains(&self.register)
    }
}

/// Default time-to-live per volatility class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
    /// Collections that change during the day (clients, pets, appointments).
    pub frequent_secs: u64,
    /// Slow-moving reference data (veterinarians, medications).
    pub reference_secs: u64,
    /// Date-ranged or otherwise parameterised queries.
    pub ranged_secs: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self { frequent_secs: 5 * 60, reference_secs: 10 * 60, ranged_secs: 2 * 60 }
    }
}

impl CacheTtls {
    pub fn frequent(&self) -> Duration {
        Duration::from_secs(self.frequent_secs)
    }

    pub fn reference(&self) -> Duration {
        Duration::from_secs(self.reference_secs)
    }

    pub fn ranged(&self) -> Duration {
        Duration::from_secs(self.ranged_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub auth: AuthEndpoints,
    pub retry: RetryConfig,
    pub cache: CacheTtls,
    /// How long before access-token expiry the proactive refresh fires.
    pub refresh_lead_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_owned(),
            auth: AuthEndpoints::default(),
            retry: RetryConfig::default(),
            cache: CacheTtls::default(),
            refresh_lead_secs: 5 * 60,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Apply `VETCARE_*` environment overrides on top of this config.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL) {
            self.base_url = url;
        }
        if let Some(raw) = lookup(ENV_RETRY_MAX) {
            self.retry.max_attempts = raw
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{ENV_RETRY_MAX}={raw} is not a count")))?;
        }
        if let Some(raw) = lookup(ENV_RETRY_BASE_MS) {
            self.retry.base_delay_ms = raw.parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_RETRY_BASE_MS}={raw} is not milliseconds"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("base_url must not be empty".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.max_delay_ms ({}) must be >= retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }
        if self.retry.max_delay_ms == 0 {
            return Err(ConfigError::Invalid("retry.max_delay_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn refresh_lead(&self) -> Duration {
        Duration::from_secs(self.refresh_lead_secs)
    }
}
