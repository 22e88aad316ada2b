//! Autoscaler error types.

use thiserror::Error;

use crate::engine::FunctionId;

/// Result type alias for autoscaler operations.
pub type AutoscaleResult<T> = Result<T, AutoscaleError>;

/// Errors that can occur on the autoscaler's public surface.
#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("already monitoring topic {topic} and function {function}")]
    AlreadyMonitoring { topic: String, function: FunctionId },

    #[error("not monitoring topic {topic} and function {function}")]
    NotMonitoring { topic: String, function: FunctionId },

    #[error("autoscaler is closed")]
    Closed,

    #[error("autoscaler is already running")]
    AlreadyRunning,
}
