//! Throughput metric events consumed by the autoscaler.
//!
//! Producer-side and consumer-side traffic is reported as aggregate counts
//! per topic (and per consumer group for the receive side). The autoscaler
//! folds these into per-window totals; it never sees individual messages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::TransportError;
use crate::message::Message;
use crate::traits::{Consumer, Producer};

/// Messages produced to a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerAggregateMetric {
    pub topic: String,
    pub count: u64,
}

/// Messages consumed from a topic by a consumer group. The group name
/// identifies the function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerAggregateMetric {
    pub topic: String,
    pub group: String,
    pub count: u64,
}

/// The receiving half handed to the autoscaler: one channel per event shape.
pub struct MetricsReceiver {
    pub producer_metrics: mpsc::Receiver<ProducerAggregateMetric>,
    pub consumer_metrics: mpsc::Receiver<ConsumerAggregateMetric>,
}

/// The emitting half, cloned into metric-emitting transport decorators.
#[derive(Clone)]
pub struct MetricsSender {
    producer_tx: mpsc::Sender<ProducerAggregateMetric>,
    consumer_tx: mpsc::Sender<ConsumerAggregateMetric>,
}

impl MetricsSender {
    /// Report messages produced to a topic. Metrics are advisory: if the
    /// receiver has fallen behind the event is dropped rather than letting
    /// the data path block on the control path.
    pub fn record_transmit(&self, topic: &str, count: u64) {
        let event = ProducerAggregateMetric {
            topic: topic.to_string(),
            count,
        };
        if self.producer_tx.try_send(event).is_err() {
            debug!(topic, "producer metric dropped, receiver backlogged");
        }
    }

    /// Report messages consumed from a topic by a group.
    pub fn record_receive(&self, topic: &str, group: &str, count: u64) {
        let event = ConsumerAggregateMetric {
            topic: topic.to_string(),
            group: group.to_string(),
            count,
        };
        if self.consumer_tx.try_send(event).is_err() {
            debug!(topic, group, "consumer metric dropped, receiver backlogged");
        }
    }
}

/// Build a connected sender/receiver pair with the given channel capacity.
pub fn metrics_channel(capacity: usize) -> (MetricsSender, MetricsReceiver) {
    let (producer_tx, producer_metrics) = mpsc::channel(capacity);
    let (consumer_tx, consumer_metrics) = mpsc::channel(capacity);
    (
        MetricsSender {
            producer_tx,
            consumer_tx,
        },
        MetricsReceiver {
            producer_metrics,
            consumer_metrics,
        },
    )
}

/// Producer decorator that reports every successful send as a count-1
/// aggregate for the target topic.
pub struct MetricsEmittingProducer<P> {
    inner: P,
    metrics: MetricsSender,
}

impl<P: Producer> MetricsEmittingProducer<P> {
    pub fn new(inner: P, metrics: MetricsSender) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl<P: Producer> Producer for MetricsEmittingProducer<P> {
    async fn send(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        self.inner.send(topic, message).await?;
        self.metrics.record_transmit(topic, 1);
        Ok(())
    }

    fn errors(&self) -> broadcast::Receiver<TransportError> {
        self.inner.errors()
    }
}

/// Consumer decorator that reports every successful receive as a count-1
/// aggregate for its consumer group.
pub struct MetricsEmittingConsumer<C> {
    inner: C,
    group: String,
    metrics: MetricsSender,
}

impl<C: Consumer> MetricsEmittingConsumer<C> {
    pub fn new(inner: C, group: impl Into<String>, metrics: MetricsSender) -> Self {
        Self {
            inner,
            group: group.into(),
            metrics,
        }
    }
}

#[async_trait]
impl<C: Consumer> Consumer for MetricsEmittingConsumer<C> {
    async fn receive(&mut self) -> Result<(Message, String), TransportError> {
        let (message, topic) = self.inner.receive().await?;
        self.metrics.record_receive(&topic, &self.group, 1);
        Ok((message, topic))
    }
}
