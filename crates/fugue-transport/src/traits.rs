//! Transport traits — the seam between fugue and the broker.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::message::Message;

/// Sends messages to arbitrary topics.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Send a message to a topic.
    ///
    /// A returned `Ok` means the message was handed to the broker client;
    /// failures that surface after that (delivery acknowledgement errors)
    /// arrive on the [`errors`](Producer::errors) stream instead.
    async fn send(&self, topic: &str, message: Message) -> Result<(), TransportError>;

    /// Subscribe to asynchronous send failures.
    fn errors(&self) -> broadcast::Receiver<TransportError>;
}

/// Receives messages, along with their topics, from a fixed,
/// implementation-defined set of topics.
#[async_trait]
pub trait Consumer: Send {
    /// Block until the next message arrives and return it with the topic
    /// it was received on.
    async fn receive(&mut self) -> Result<(Message, String), TransportError>;
}

/// Inspects the transport.
#[async_trait]
pub trait Inspector: Send + Sync {
    /// Current queue length of the given topic from the perspective of the
    /// given function's consumer group.
    async fn queue_length(&self, topic: &str, function: &str) -> Result<i64, TransportError>;
}
