//! Tracing bootstrap
//!
//! Installs a global `tracing-subscriber` with an [`EnvFilter`] that honours
//! `RUST_LOG` and falls back to the supplied directive.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid filter directive: {0}")]
    Directive(String),
    #[error("global subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directive used when `RUST_LOG` is unset, e.g. `"squadron=info"`
    pub default_directive: String,
    /// Emit newline-delimited JSON instead of human-readable lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            json: false,
        }
    }
}

fn build_filter(directive: &str) -> Result<EnvFilter, LoggingError> {
    let directive = directive
        .parse()
        .map_err(|e: tracing_subscriber::filter::ParseError| LoggingError::Directive(e.to_string()))?;
    Ok(EnvFilter::from_default_env().add_directive(directive))
}

/// Install the global subscriber.
///
/// Returns [`LoggingError::AlreadyInstalled`] instead of panicking when a
/// subscriber exists, so tests and embedding hosts can call it freely.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(&config.default_directive)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
}
