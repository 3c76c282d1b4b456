//! Error types for Switchyard Core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Catalog / store errors
    #[error("Store error: {0}")]
    Store(String),

    // Selection errors
    #[error("No usable upstream: {0}")]
    NoUsableUpstream(String),

    #[error("Channel group not found: {0}")]
    GroupNotFound(String),

    #[error("Channel group disabled: {0}")]
    GroupDisabled(String),

    #[error("Channel group {0} exhausted")]
    GroupExhausted(i64),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller should answer with the uniform "upstream unavailable" response
    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(
            self,
            Error::NoUsableUpstream(_)
                | Error::GroupNotFound(_)
                | Error::GroupDisabled(_)
                | Error::GroupExhausted(_)
                | Error::UpstreamUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
