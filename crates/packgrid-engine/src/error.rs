//! Error types for the engine controller and its daemon client.

use packgrid_queue::TaskError;
use packgrid_state::StateError;
use thiserror::Error;

/// Failure talking to a container daemon.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DaemonError {
    #[error("no such object: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("daemon returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("daemon call timed out: {0}")]
    Timeout(String),

    #[error("unexpected daemon response: {0}")]
    BadResponse(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl DaemonError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DaemonError::NotFound(_))
    }
}

pub type DaemonResult<T> = Result<T, DaemonError>;

/// Errors surfaced by [`EngineController`](crate::EngineController).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The request is refused without touching any state.
    #[error("{0}")]
    Rejected(String),

    #[error("engine {0} is not ready")]
    NotReady(String),

    #[error("not enough free IPs: need {needed}, have {free}")]
    NoFreeIps { needed: usize, free: usize },

    #[error("internal IP space exhausted for {0}")]
    InternalIpExhausted(String),

    #[error("invalid bind: {0}")]
    InvalidBind(String),

    #[error("invalid port spec: {0}")]
    InvalidPortSpec(String),

    #[error("invalid image name: {0}")]
    InvalidImage(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("container {0} did not reach running state")]
    StartFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Unwrap the error a queued task failed with, so callers can match on
    /// it as if they had run the work inline.
    pub fn from_task(err: TaskError) -> Self {
        let inner = err.failure().and_then(|f| f.downcast_ref::<EngineError>());
        match inner {
            Some(EngineError::NotFound { kind, id }) => EngineError::NotFound {
                kind: *kind,
                id: id.clone(),
            },
            Some(EngineError::Rejected(msg)) => EngineError::Rejected(msg.clone()),
            Some(EngineError::NotReady(id)) => EngineError::NotReady(id.clone()),
            Some(EngineError::NoFreeIps { needed, free }) => EngineError::NoFreeIps {
                needed: *needed,
                free: *free,
            },
            Some(EngineError::Timeout(what)) => EngineError::Timeout(what.clone()),
            Some(EngineError::StartFailed(id)) => EngineError::StartFailed(id.clone()),
            Some(EngineError::Daemon(e)) => EngineError::Daemon(e.clone()),
            Some(EngineError::Task(e)) => EngineError::Task(e.clone()),
            _ => EngineError::Task(err),
        }
    }

    /// True when the daemon reported a missing object.
    pub fn is_daemon_not_found(&self) -> bool {
        matches!(self, EngineError::Daemon(e) if e.is_not_found())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use packgrid_queue::TaskQueue;
    use serde_json::json;

    #[tokio::test]
    async fn task_failures_keep_their_engine_error() {
        let queue = TaskQueue::new("t", 1);
        let handle = queue.post("fail", json!({}), || async {
            Err::<(), _>(EngineError::Rejected("Upgrade already queued.".into()))
        });
        let err = EngineError::from_task(handle.wait().await.unwrap_err());
        assert!(matches!(err, EngineError::Rejected(ref m) if m == "Upgrade already queued."));

        let handle = queue.post("missing", json!({}), || async {
            Err::<(), _>(EngineError::Daemon(DaemonError::NotFound("No such image: x".into())))
        });
        let err = EngineError::from_task(handle.wait().await.unwrap_err());
        assert!(err.is_daemon_not_found());
    }

    #[tokio::test]
    async fn foreign_failures_stay_wrapped() {
        let queue = TaskQueue::new("t", 1);
        let handle = queue.post("other", json!({}), || async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        });
        let err = EngineError::from_task(handle.wait().await.unwrap_err());
        assert!(matches!(err, EngineError::Task(_)));
        assert!(err.to_string().contains("boom"));
    }
}
