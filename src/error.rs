//! Error types for batch lookups and configuration loading.

use thiserror::Error;

/// Failure of one batch network call.
///
/// These never reach `queue` callers; the batcher logs them and substitutes
/// fallback payloads.
#[derive(Error, Debug)]
pub enum LookupError {
    /// Connection, DNS, TLS or timeout failure.
    #[error("Request failed: {0}")]
    Transport(String),

    /// The endpoint answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body could not be decoded.
    #[error("Invalid JSON response: {0}")]
    Decode(String),

    /// The source panicked while serving the batch.
    #[error("Batch source panicked: {0}")]
    Panicked(String),
}

/// Failure while loading or creating the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
