//! Error types for `StreamRelay` core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using `StreamRelay` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `StreamRelay` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Config file is not valid JSON for the expected schema
    #[error("Failed to parse config file {}: {}", .path.display(), .source)]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Config file could not be read
    #[error("Failed to read config file {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
