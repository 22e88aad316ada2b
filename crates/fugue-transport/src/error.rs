//! Transport error types.

use thiserror::Error;

/// Result type alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur on the transport seam.
///
/// `Clone` because delivery failures are rebroadcast on the producer's
/// asynchronous error stream.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to send message: {0}")]
    Send(String),

    #[error("delivery not acknowledged: {0}")]
    Delivery(String),

    #[error("failed to receive message: {0}")]
    Receive(String),

    #[error("failed to inspect queue: {0}")]
    Inspect(String),
}
