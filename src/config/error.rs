//! Configuration error types

use thiserror::Error;

/// Errors raised while loading or validating the TOML configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration value is invalid
    #[error("invalid configuration for {key}: '{value}' ({reason})")]
    InvalidValue { key: String, value: String, reason: String },

    /// A required configuration value is missing
    #[error("missing required configuration: {key} ({hint})")]
    MissingRequired { key: String, hint: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}
