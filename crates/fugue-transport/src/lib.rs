//! fugue-transport — message transport abstraction.
//!
//! Defines the broker-facing seam shared by the autoscaler and the sidecar:
//!
//! - [`Producer`] sends messages to named topics and surfaces asynchronous
//!   delivery failures on an error stream
//! - [`Consumer`] pulls messages, with their topic, from a fixed topic set
//! - [`Inspector`] reports backlog length for a (topic, function) pair
//!
//! Two implementations ship with the crate: an in-process [`memory`]
//! transport backed by per-topic queues (the test vehicle) and a
//! [`nats`] transport backed by NATS JetStream for real deployments.
//! The [`metrics`] module carries the aggregate throughput events the
//! autoscaler folds into its per-window totals.

pub mod error;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod nats;
pub mod traits;

pub use error::{TransportError, TransportResult};
pub use memory::MemoryTransport;
pub use message::Message;
pub use metrics::{
    ConsumerAggregateMetric, MetricsEmittingConsumer, MetricsEmittingProducer, MetricsReceiver,
    MetricsSender, ProducerAggregateMetric, metrics_channel,
};
pub use traits::{Consumer, Inspector, Producer};
