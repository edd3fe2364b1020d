//! Error type shared by the registry and the cells

use std::sync::Arc;

/// Error produced by a user-supplied reload function
pub type ReloadError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in buffer operations
#[derive(Debug, thiserror::Error)]
pub enum BuffError {
    #[error("buffer '{0}' not registered")]
    NotRegistered(String),

    #[error("buffer '{0}' already registered")]
    AlreadyRegistered(String),

    #[error("buffer '{name}' holds {actual}, requested as {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Reported to the caller that ran the reload and to every `load`
    /// that was waiting for it, hence the shared source.
    #[error("reload of buffer '{name}' failed: {source}")]
    ReloadFailed {
        name: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid registry config: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BuffError>;
