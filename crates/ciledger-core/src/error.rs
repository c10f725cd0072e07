//! Error types for ciledger-core.
//!
//! Only failures the caller must act on are errors. Corrupt persisted state
//! and malformed usage records are recovered where they are read, and budget
//! denials are decisions (see [`crate::budget::Decision`]), not errors.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::lock::LockError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for ledger and budget operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Lock acquisition failed. A timeout means no mutation was attempted.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Configuration could not be read or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Required pricing/limits configuration is absent.
    #[error("required configuration not found: {}", path.display())]
    MissingConfig { path: PathBuf },

    /// Filesystem failure on a specific path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Serialization of a document failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Caller supplied an unusable value.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether retrying the same call later can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Lock(LockError::Timeout { .. }))
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("failed to parse config: {0}")]
    ParseFailed(String),

    #[error("invalid config: {0}")]
    ValidationError(String),
}
