//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration handling.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating `forge.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    #[error("no hypervisor password: set FORGE_HYPERVISOR_PASSWORD, hypervisor.password or hypervisor.password_command")]
    MissingPassword,

    #[error("password command failed: {0}")]
    PasswordCommand(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
