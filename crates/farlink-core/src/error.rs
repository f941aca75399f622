//! Core error types for farlink

use std::path::PathBuf;
use thiserror::Error;

/// Errors from parsing a connection target out of a URI
#[derive(Error, Debug)]
pub enum ContextError {
    /// The URI could not be parsed at all
    #[error("Invalid connection URI: {0}")]
    InvalidUri(#[from] url::ParseError),

    /// The URI parsed but uses a scheme this subsystem does not speak
    #[error("Unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    /// A required component of the target is absent
    #[error("Connection URI is missing {0}")]
    MissingField(&'static str),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
