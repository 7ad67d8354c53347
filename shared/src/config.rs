use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::capabilities::{CaptureConfig, PositionOptions, ValidatedUrl};
use crate::evidence::ReadingPolicy;
use crate::{
    AppError, ErrorKind, ACKNOWLEDGED_EVIDENCE_CACHE, DEFAULT_LOCATION_TIMEOUT,
    DEFAULT_PERIODIC_INTERVAL, DEFAULT_REQUEST_TIMEOUT, FUEL_CONFIRMATION_DELAY,
};

pub const ENV_BASE_URL: &str = "TRIPPROOF_BASE_URL";
pub const ENV_AUTH_TOKEN: &str = "TRIPPROOF_AUTH_TOKEN";
pub const ENV_LOG: &str = "TRIPPROOF_LOG";

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Configuration, "configuration could not be loaded")
            .with_internal(e.to_string())
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub auth_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            request_timeout_ms: millis(DEFAULT_REQUEST_TIMEOUT),
            auth_token: None,
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LocationConfig {
    pub high_accuracy: bool,
    pub timeout_ms: u64,
    pub maximum_age_ms: u64,
    pub periodic_interval_ms: u64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout_ms: millis(DEFAULT_LOCATION_TIMEOUT),
            maximum_age_ms: 0,
            periodic_interval_ms: millis(DEFAULT_PERIODIC_INTERVAL),
        }
    }
}

impl LocationConfig {
    #[must_use]
    pub fn position_options(&self) -> PositionOptions {
        PositionOptions {
            high_accuracy: self.high_accuracy,
            timeout: Duration::from_millis(self.timeout_ms),
            maximum_age: Duration::from_millis(self.maximum_age_ms),
        }
    }

    #[must_use]
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubmissionConfig {
    pub fuel_confirmation_delay_ms: u64,
    pub acknowledged_cache_size: usize,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            fuel_confirmation_delay_ms: millis(FUEL_CONFIRMATION_DELAY),
            acknowledged_cache_size: ACKNOWLEDGED_EVIDENCE_CACHE,
        }
    }
}

impl SubmissionConfig {
    #[must_use]
    pub fn fuel_confirmation_delay(&self) -> Duration {
        Duration::from_millis(self.fuel_confirmation_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info,tripproof_shared=debug`.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoreConfig {
    pub backend: BackendConfig,
    pub capture: CaptureConfig,
    pub location: LocationConfig,
    pub submission: SubmissionConfig,
    pub readings: ReadingPolicy,
    pub logging: LoggingConfig,
}

impl CoreConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, applies `TRIPPROOF_*` overrides and validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        info!(path = %path.display(), backend = %config.backend.base_url, "configuration loaded");
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.backend.base_url = url;
        }
        if let Some(token) = lookup(ENV_AUTH_TOKEN) {
            self.backend.auth_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(filter) = lookup(ENV_LOG).filter(|v| !v.trim().is_empty()) {
            self.logging.filter = filter;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ValidatedUrl::new(&self.backend.base_url)
            .map_err(|e| ConfigError::Validation(format!("backend.base_url: {e}")))?;
        if self.backend.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "backend.request_timeout_ms must be > 0".into(),
            ));
        }
        if self.capture.ready_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "capture.ready_timeout_ms must be > 0".into(),
            ));
        }
        if self.capture.max_image_bytes == 0 {
            return Err(ConfigError::Validation(
                "capture.max_image_bytes must be > 0".into(),
            ));
        }
        if self.location.timeout_ms == 0 {
            return Err(ConfigError::Validation("location.timeout_ms must be > 0".into()));
        }
        if self.location.periodic_interval_ms < 1000 {
            return Err(ConfigError::Validation(
                "location.periodic_interval_ms should be at least 1000ms".into(),
            ));
        }
        if self.submission.acknowledged_cache_size == 0 {
            return Err(ConfigError::Validation(
                "submission.acknowledged_cache_size must be > 0".into(),
            ));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::Validation("logging.filter must not be empty".into()));
        }
        Ok(())
    }
}
