//! Error types for Tapedeck

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for Tapedeck operations
pub type Result<T> = std::result::Result<T, TapedeckError>;

/// Errors that can occur in Tapedeck
#[derive(Debug, Error)]
pub enum TapedeckError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No fixture file, or no matching snapshot in it, while replaying
    #[error("{} not found", .0.display())]
    FixtureNotFound(PathBuf),

    /// Fixture file could not be parsed
    #[error("Malformed fixture {}: {message}", path.display())]
    Parse {
        /// Fixture file that failed to parse
        path: PathBuf,
        /// Parser diagnostic
        message: String,
    },

    /// Upstream exchange failed while recording
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// Inbound request could not be turned into an upstream request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Request/response too large
    #[error("Data too large: {size} bytes exceeds limit of {limit} bytes")]
    DataTooLarge {
        /// Actual size
        size: usize,
        /// Size limit
        limit: usize,
    },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl TapedeckError {
    /// Build a parse error for a fixture file
    pub fn parse(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
