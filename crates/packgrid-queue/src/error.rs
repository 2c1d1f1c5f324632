//! Task queue error types.

use std::sync::Arc;

use thiserror::Error;

/// Outcome of a task that did not produce a value.
///
/// Cloneable so every waiter of a shared task observes the same failure.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("queue reset: {kind}")]
    Cancelled { kind: String },

    #[error("task removed: {kind}")]
    Removed { kind: String },

    #[error("task crashed: {kind}: {error}")]
    Failed {
        kind: String,
        error: Arc<anyhow::Error>,
    },

    #[error("task panicked: {kind}")]
    Panicked { kind: String },

    #[error("task dropped before completion: {kind}")]
    Dropped { kind: String },

    #[error("task output has an unexpected type: {kind}")]
    OutputType { kind: String },
}

impl TaskError {
    /// The error the task body returned, if it ran and failed.
    pub fn failure(&self) -> Option<&anyhow::Error> {
        match self {
            TaskError::Failed { error, .. } => Some(error.as_ref()),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. } | TaskError::Removed { .. })
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
