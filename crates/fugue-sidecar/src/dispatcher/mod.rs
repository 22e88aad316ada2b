//! Protocol adapters for invoking the colocated function process.

pub mod grpc;
pub mod http;

use async_trait::async_trait;
use tokio::sync::watch;

use fugue_transport::Message;

use crate::config::{Config, Protocol};
use crate::error::SidecarError;

/// Invokes the function with one message at a time.
///
/// The two adapters form a closed set selected by configuration at
/// startup: plain request/response over HTTP, or a long-lived
/// bidirectional gRPC stream.
#[async_trait]
pub trait Dispatcher: Send {
    /// Forward one message to the function and return its response, if
    /// the function produced one.
    async fn dispatch(&mut self, message: Message) -> Result<Option<Message>, SidecarError>;

    /// Signal raised when the function irrecoverably ends its stream.
    /// HTTP functions have no stream and never raise it.
    fn closed(&self) -> watch::Receiver<bool>;
}

impl std::fmt::Debug for dyn Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Dispatcher")
    }
}

/// Build the dispatcher the configuration asks for.
pub async fn connect(config: &Config) -> Result<Box<dyn Dispatcher>, SidecarError> {
    match config.protocol {
        Protocol::Http => Ok(Box::new(http::HttpDispatcher::new(config.port)?)),
        Protocol::Grpc => Ok(Box::new(
            grpc::GrpcDispatcher::connect(config.port, config.call_timeout()).await?,
        )),
    }
}
