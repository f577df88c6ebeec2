//! Error type shared by the collaborator ports and local stores.
//!
//! None of these errors cross the public `EntitlementEngine` boundary; the
//! engine converts every failure into a degraded-but-valid value.

use std::time::Duration;

/// Errors raised below the engine boundary
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Network or service failure on a remote source
    #[error("{source_name} failed: {message}")]
    Remote {
        source_name: &'static str,
        message: String,
    },
    /// A remote source did not answer within its bound
    #[error("{source_name} timed out after {after:?}")]
    Timeout {
        source_name: &'static str,
        after: Duration,
    },
    /// Local persistence failure
    #[error("Storage error: {0}")]
    Storage(String),
    /// Snapshot (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Raw collaborator payload carried a value outside the known enum
    #[error("Unknown {field} value: '{value}'")]
    UnknownValue { field: &'static str, value: String },
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// True for failures that are recovered by falling back to the cache
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote { .. } | Self::Timeout { .. })
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
