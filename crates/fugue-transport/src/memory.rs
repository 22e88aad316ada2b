//! In-process transport backed by per-topic queues.
//!
//! Single-process stand-in for a real broker: producers push onto named
//! queues, consumers pop from their topic set, the inspector reports queue
//! depth. Used throughout the fugue test suites and for local experiments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};

use crate::error::TransportError;
use crate::message::Message;
use crate::traits::{Consumer, Inspector, Producer};

struct Shared {
    topics: Mutex<HashMap<String, VecDeque<Message>>>,
    notify: Notify,
}

/// Handle to one in-memory broker. Clones share the same queues.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    error_tx: broadcast::Sender<TransportError>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (error_tx, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                topics: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
            error_tx,
        }
    }

    /// A producer over this broker.
    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            shared: self.shared.clone(),
            error_tx: self.error_tx.clone(),
        }
    }

    /// A consumer pulling from the given topic set.
    pub fn consumer(&self, topics: Vec<String>) -> MemoryConsumer {
        MemoryConsumer {
            shared: self.shared.clone(),
            topics,
        }
    }

    /// An inspector over this broker's queues.
    pub fn inspector(&self) -> MemoryInspector {
        MemoryInspector {
            shared: self.shared.clone(),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryProducer {
    shared: Arc<Shared>,
    error_tx: broadcast::Sender<TransportError>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        {
            let mut topics = self
                .shared
                .topics
                .lock()
                .map_err(|_| TransportError::Send("queue lock poisoned".into()))?;
            topics.entry(topic.to_string()).or_default().push_back(message);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    fn errors(&self) -> broadcast::Receiver<TransportError> {
        // In-memory delivery cannot fail after send() returns; the stream
        // exists to satisfy the contract and never fires.
        self.error_tx.subscribe()
    }
}

pub struct MemoryConsumer {
    shared: Arc<Shared>,
    topics: Vec<String>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn receive(&mut self) -> Result<(Message, String), TransportError> {
        loop {
            {
                let mut topics = self
                    .shared
                    .topics
                    .lock()
                    .map_err(|_| TransportError::Receive("queue lock poisoned".into()))?;
                for topic in &self.topics {
                    if let Some(queue) = topics.get_mut(topic)
                        && let Some(message) = queue.pop_front()
                    {
                        return Ok((message, topic.clone()));
                    }
                }
            }
            self.shared.notify.notified().await;
        }
    }
}

pub struct MemoryInspector {
    shared: Arc<Shared>,
}

#[async_trait]
impl Inspector for MemoryInspector {
    async fn queue_length(&self, topic: &str, _function: &str) -> Result<i64, TransportError> {
        let topics = self
            .shared
            .topics
            .lock()
            .map_err(|_| TransportError::Inspect("queue lock poisoned".into()))?;
        Ok(topics.get(topic).map(|q| q.len() as i64).unwrap_or(0))
    }
}
