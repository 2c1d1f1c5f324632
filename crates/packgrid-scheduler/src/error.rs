//! Scheduler error types.

use thiserror::Error;

use packgrid_engine::EngineError;

/// Why a submitted request did not produce its result.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("request {0} removed from queue")]
    Removed(String),

    #[error("dispatch to engine {engine} failed: {source}")]
    Dispatch {
        engine: String,
        #[source]
        source: EngineError,
    },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("scheduler stopped before the request completed")]
    Closed,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
