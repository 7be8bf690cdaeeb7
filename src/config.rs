//! Environment configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const ENV_CHAT_URL: &str = "THREAD_SESSION_CHAT_URL";
pub const ENV_STORE_URL: &str = "THREAD_SESSION_STORE_URL";
pub const ENV_STORE_FILE: &str = "THREAD_SESSION_STORE_FILE";
pub const ENV_ACCESS_TOKEN: &str = "THREAD_SESSION_ACCESS_TOKEN";
pub const ENV_USER_ID: &str = "THREAD_SESSION_USER_ID";
pub const ENV_MODEL_CATALOG: &str = "THREAD_SESSION_MODEL_CATALOG";
pub const ENV_TIMEOUT_SEC: &str = "THREAD_SESSION_TIMEOUT_SEC";
pub const ENV_LOG: &str = "THREAD_SESSION_LOG";

pub const DEFAULT_USER_ID: &str = "local-user";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be a positive number of seconds, got '{value}'")]
    InvalidTimeout { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub chat_url: Option<String>,
    pub store_url: Option<String>,
    /// JSON file backing the local store when no store URL is configured.
    pub store_file: Option<PathBuf>,
    pub access_token: Option<String>,
    pub user_id: String,
    pub model_catalog: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub log_filter: Option<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            chat_url: None,
            store_url: None,
            store_file: None,
            access_token: None,
            user_id: DEFAULT_USER_ID.to_string(),
            model_catalog: None,
            timeout: None,
            log_filter: None,
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable lookup. Blank values are
    /// treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string_opt = |key: &str| non_blank(lookup(key));

        let timeout = match string_opt(ENV_TIMEOUT_SEC) {
            None => None,
            Some(value) => Some(parse_timeout(&value)?),
        };

        Ok(Self {
            chat_url: string_opt(ENV_CHAT_URL),
            store_url: string_opt(ENV_STORE_URL),
            store_file: string_opt(ENV_STORE_FILE).map(PathBuf::from),
            access_token: string_opt(ENV_ACCESS_TOKEN),
            user_id: string_opt(ENV_USER_ID).unwrap_or_else(|| DEFAULT_USER_ID.to_string()),
            model_catalog: string_opt(ENV_MODEL_CATALOG).map(PathBuf::from),
            timeout,
            log_filter: string_opt(ENV_LOG),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_timeout(value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| ConfigError::InvalidTimeout {
            key: ENV_TIMEOUT_SEC,
            value: value.to_string(),
        })
}
