use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
    pub auth_clock_skew: Duration,
    pub max_batch_len: usize,
    pub max_page_size: usize,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("db_path", &self.db_path)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("max_batch_len", &self.max_batch_len)
            .field("max_page_size", &self.max_page_size)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "KHATA_BIND_ADDR", "127.0.0.1:8080");

        let db_path = PathBuf::from(required_trimmed(&lookup, "KHATA_DB_PATH")?);

        let jwt_secret = required_trimmed(&lookup, "KHATA_JWT_SECRET")?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid(
                "KHATA_JWT_SECRET must be at least 32 bytes".to_string(),
            ));
        }

        let jwt_issuer = optional_trimmed(&lookup, "KHATA_JWT_ISSUER");

        let auth_clock_skew_secs = value_or_default(&lookup, "KHATA_AUTH_CLOCK_SKEW_SECS", "60")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "KHATA_AUTH_CLOCK_SKEW_SECS must be an integer in [0, 300]".to_string(),
                )
            })?;
        if auth_clock_skew_secs > 300 {
            return Err(ConfigError::Invalid(
                "KHATA_AUTH_CLOCK_SKEW_SECS must be in [0, 300]".to_string(),
            ));
        }

        let max_batch_len = value_or_default(&lookup, "KHATA_MAX_BATCH_LEN", "200")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid("KHATA_MAX_BATCH_LEN must be an integer in [1, 1000]".to_string())
            })?;
        if !(1..=1_000).contains(&max_batch_len) {
            return Err(ConfigError::Invalid(
                "KHATA_MAX_BATCH_LEN must be in [1, 1000]".to_string(),
            ));
        }

        let max_page_size = value_or_default(&lookup, "KHATA_MAX_PAGE_SIZE", "500")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid("KHATA_MAX_PAGE_SIZE must be an integer in [1, 500]".to_string())
            })?;
        if !(1..=500).contains(&max_page_size) {
            return Err(ConfigError::Invalid(
                "KHATA_MAX_PAGE_SIZE must be in [1, 500]".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            db_path,
            jwt_secret,
            jwt_issuer,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            max_batch_len,
            max_page_size,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
