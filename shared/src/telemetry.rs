//! Subscriber setup for native shells and tests. Mobile shells that install
//! their own subscriber skip this.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::{AppError, AppResult, ErrorKind};

/// `RUST_LOG` wins over the configured filter.
pub fn env_filter(config: &LoggingConfig) -> AppResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter).map_err(|e| {
        AppError::new(ErrorKind::Configuration, "invalid log filter")
            .with_internal(e.to_string())
            .with_context("filter", config.filter.clone())
    })
}

/// Installs the global subscriber. Fails if one is already set.
pub fn init_tracing(config: &LoggingConfig) -> AppResult<()> {
    let filter = env_filter(config)?;

    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    result.map_err(|e| {
        AppError::new(ErrorKind::Configuration, "tracing already initialized")
            .with_internal(e.to_string())
    })
}
