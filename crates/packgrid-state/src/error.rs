//! Error types for the packgrid state store.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("failed to parse {path}: {message}")]
    Deserialize { path: PathBuf, message: String },

    #[error("bad item id: empty")]
    MissingId,

    #[error("bad item id: {0}")]
    InvalidId(String),

    #[error("{collection}: item not found: {id}")]
    NotFound { collection: String, id: String },
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StateError {
        let path = path.into();
        move |source| StateError::Io { path, source }
    }
}
