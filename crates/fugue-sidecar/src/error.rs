//! Sidecar error types.

use thiserror::Error;

use fugue_transport::TransportError;

pub type SidecarResult<T> = Result<T, SidecarError>;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid backoff policy: {0}")]
    InvalidBackoff(&'static str),

    #[error("failed to connect dispatcher: {0}")]
    DispatcherConnect(String),

    #[error("dispatcher connection retries exhausted")]
    RetriesExhausted,

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("function stream closed")]
    StreamClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
