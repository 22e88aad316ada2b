//! NATS JetStream transport.
//!
//! One JetStream stream per topic (limits retention, file storage), durable
//! pull consumers named after the consumer group, and backlog inspection via
//! the consumer's pending count. Metric events travel over plain core-NATS
//! subjects so a controller-side autoscaler can fold sidecar traffic without
//! touching the durable streams.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::Client;
use async_nats::jetstream;
use async_nats::jetstream::consumer::pull::Config as PullConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, PullConsumer};
use async_nats::jetstream::stream::Config as StreamConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, SelectAll, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::message::Message;
use crate::metrics::{
    ConsumerAggregateMetric, MetricsReceiver, ProducerAggregateMetric, metrics_channel,
};
use crate::traits::{Consumer, Inspector, Producer};

/// Subject carrying [`ProducerAggregateMetric`] events.
pub const PRODUCER_METRICS_SUBJECT: &str = "fugue.metrics.producer";
/// Subject carrying [`ConsumerAggregateMetric`] events.
pub const CONSUMER_METRICS_SUBJECT: &str = "fugue.metrics.consumer";

/// Stream names may not contain subject wildcards or separators.
fn stream_name(topic: &str) -> String {
    format!("FUGUE-{}", topic.replace(['.', '*', '>', '/', '\\', ' '], "-"))
}

fn durable_name(group: &str) -> String {
    group.replace(['.', '*', '>', '/', '\\', ' '], "-")
}

/// Connection to a NATS cluster with JetStream enabled.
#[derive(Clone)]
pub struct NatsTransport {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsTransport {
    /// Connect to the given server URLs.
    pub async fn connect(urls: &[String]) -> Result<Self, TransportError> {
        let addrs = urls.join(",");
        let client = async_nats::ConnectOptions::new()
            .name("fugue")
            .connect(addrs)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());
        info!(servers = ?urls, "connected to NATS");
        Ok(Self { client, jetstream })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// A producer publishing to JetStream streams.
    pub fn producer(&self) -> NatsProducer {
        let (error_tx, _) = broadcast::channel(64);
        NatsProducer {
            jetstream: self.jetstream.clone(),
            error_tx,
        }
    }

    /// A durable pull consumer for `group` over the given topics.
    ///
    /// Streams and consumers are created on demand and survive restarts.
    pub async fn consumer(
        &self,
        group: &str,
        topics: Vec<String>,
    ) -> Result<NatsConsumer, TransportError> {
        let mut streams = SelectAll::new();
        let mut consumers = Vec::new();

        for topic in &topics {
            let mut stream = self
                .ensure_stream(topic)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            let config = PullConsumerConfig {
                durable_name: Some(durable_name(group)),
                deliver_policy: DeliverPolicy::All,
                ack_policy: AckPolicy::Explicit,
                ack_wait: Duration::from_secs(30),
                ..Default::default()
            };
            let consumer = stream
                .get_or_create_consumer(&durable_name(group), config)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;

            let messages = consumer
                .messages()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            streams.push(
                messages
                    .map(|r| r.map_err(|e| TransportError::Receive(e.to_string())))
                    .boxed(),
            );
            consumers.push(consumer);
            debug!(topic, group, "durable consumer ready");
        }

        Ok(NatsConsumer {
            messages: streams,
            _consumers: consumers,
        })
    }

    /// An inspector reading backlog from consumer pending counts.
    pub fn inspector(&self) -> NatsInspector {
        NatsInspector {
            jetstream: self.jetstream.clone(),
        }
    }

    async fn ensure_stream(
        &self,
        topic: &str,
    ) -> Result<jetstream::stream::Stream, async_nats::Error> {
        let config = StreamConfig {
            name: stream_name(topic),
            subjects: vec![topic.to_string()],
            max_age: Duration::from_secs(24 * 60 * 60),
            storage: jetstream::stream::StorageType::File,
            num_replicas: 1,
            ..Default::default()
        };
        let stream = self.jetstream.get_or_create_stream(config).await?;
        Ok(stream)
    }
}

pub struct NatsProducer {
    jetstream: jetstream::Context,
    error_tx: broadcast::Sender<TransportError>,
}

#[async_trait]
impl Producer for NatsProducer {
    async fn send(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        let (payload, headers) = message.into_parts();

        let mut header_map = async_nats::HeaderMap::new();
        for (name, value) in &headers {
            header_map.insert(name.as_str(), value.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(topic.to_string(), header_map, Bytes::from(payload))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;

        // Delivery acknowledgement completes after send() returns; failures
        // surface on the error stream.
        let error_tx = self.error_tx.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            if let Err(e) = ack.await {
                warn!(topic, error = %e, "delivery not acknowledged");
                let _ = error_tx.send(TransportError::Delivery(e.to_string()));
            }
        });

        Ok(())
    }

    fn errors(&self) -> broadcast::Receiver<TransportError> {
        self.error_tx.subscribe()
    }
}

type MessageStream = BoxStream<'static, Result<jetstream::Message, TransportError>>;

pub struct NatsConsumer {
    messages: SelectAll<MessageStream>,
    _consumers: Vec<PullConsumer>,
}

#[async_trait]
impl Consumer for NatsConsumer {
    async fn receive(&mut self) -> Result<(Message, String), TransportError> {
        match self.messages.next().await {
            Some(Ok(msg)) => {
                let topic = msg.subject.to_string();
                let headers = convert_headers(msg.headers.as_ref());
                let message = Message::from_parts(msg.payload.to_vec(), headers);
                msg.ack()
                    .await
                    .map_err(|e| TransportError::Receive(e.to_string()))?;
                Ok((message, topic))
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Receive("message stream ended".into())),
        }
    }
}

/// Flatten NATS headers to the message's single-valued string headers.
/// Only the first value of a multi-valued header survives.
fn convert_headers(headers: Option<&async_nats::HeaderMap>) -> HashMap<String, String> {
    let mut converted = HashMap::new();
    if let Some(map) = headers {
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                converted.insert(name.to_string(), value.to_string());
            }
        }
    }
    converted
}

pub struct NatsInspector {
    jetstream: jetstream::Context,
}

#[async_trait]
impl Inspector for NatsInspector {
    async fn queue_length(&self, topic: &str, function: &str) -> Result<i64, TransportError> {
        let mut stream = self
            .jetstream
            .get_stream(stream_name(topic))
            .await
            .map_err(|e| TransportError::Inspect(e.to_string()))?;
        let mut consumer: PullConsumer = stream
            .get_consumer(&durable_name(function))
            .await
            .map_err(|e| TransportError::Inspect(e.to_string()))?;
        let info = consumer
            .info()
            .await
            .map_err(|e| TransportError::Inspect(e.to_string()))?;
        Ok(info.num_pending as i64)
    }
}

/// Forward locally collected metric events to the metrics subjects.
///
/// Runs until both metric channels close (the emitting decorators dropped).
pub fn spawn_metrics_forwarder(client: Client, mut receiver: MetricsReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = receiver.producer_metrics.recv() => {
                    publish_metric(&client, PRODUCER_METRICS_SUBJECT, &event).await;
                }
                Some(event) = receiver.consumer_metrics.recv() => {
                    publish_metric(&client, CONSUMER_METRICS_SUBJECT, &event).await;
                }
                else => break,
            }
        }
        debug!("metrics forwarder stopped");
    })
}

async fn publish_metric<T: serde::Serialize>(client: &Client, subject: &'static str, event: &T) {
    match serde_json::to_vec(event) {
        Ok(payload) => {
            if let Err(e) = client.publish(subject, payload.into()).await {
                warn!(subject, error = %e, "failed to publish metric event");
            }
        }
        Err(e) => warn!(subject, error = %e, "failed to encode metric event"),
    }
}

/// Subscribe to the metrics subjects and bridge events into a
/// [`MetricsReceiver`] suitable for the autoscaler.
pub async fn nats_metrics_receiver(
    client: &Client,
    capacity: usize,
) -> Result<MetricsReceiver, TransportError> {
    let (sender, receiver) = metrics_channel(capacity);

    let mut producer_sub = client
        .subscribe(PRODUCER_METRICS_SUBJECT)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let mut consumer_sub = client
        .subscribe(CONSUMER_METRICS_SUBJECT)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let producer_sender = sender.clone();
    tokio::spawn(async move {
        while let Some(msg) = producer_sub.next().await {
            match serde_json::from_slice::<ProducerAggregateMetric>(&msg.payload) {
                Ok(event) => producer_sender.record_transmit(&event.topic, event.count),
                Err(e) => warn!(error = %e, "malformed producer metric event"),
            }
        }
    });
    tokio::spawn(async move {
        while let Some(msg) = consumer_sub.next().await {
            match serde_json::from_slice::<ConsumerAggregateMetric>(&msg.payload) {
                Ok(event) => sender.record_receive(&event.topic, &event.group, event.count),
                Err(e) => warn!(error = %e, "malformed consumer metric event"),
            }
        }
    });

    Ok(receiver)
}
