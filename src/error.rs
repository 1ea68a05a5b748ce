//! Error types for Beacon context

use thiserror::Error;

/// Result type alias for Beacon context operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or caching conversation context
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Setting key is not in the settings table
    #[error("unknown setting `{key}`; valid keys: {valid}")]
    UnknownSetting { key: String, valid: String },

    /// Setting value or cache entry rejected before touching storage
    #[error("invalid value: {0}")]
    Validation(String),

    /// Summarization provider failed (network, non-2xx, empty output, timeout)
    #[error("provider error: {0}")]
    Provider(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

