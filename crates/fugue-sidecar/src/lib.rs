//! fugue-sidecar — per-replica dispatch loop.
//!
//! Each function replica runs one sidecar process. It consumes messages
//! from the function's input topic, invokes the colocated function
//! container over HTTP or gRPC, and publishes replies to the output
//! topic, reporting throughput metrics for the autoscaler along the way.
//! Connection to the function is retried with bounded exponential
//! backoff while the container boots.

pub mod backoff;
pub mod carrier;
pub mod config;
pub mod dispatcher;
pub mod error;

use std::future::Future;

use tokio::sync::watch;
use tracing::{info, warn};

use fugue_transport::nats::{spawn_metrics_forwarder, NatsTransport};
use fugue_transport::{metrics_channel, MetricsEmittingConsumer, MetricsEmittingProducer, Producer};

pub use backoff::Backoff;
pub use carrier::LoopExit;
pub use config::{Config, Protocol};
pub use dispatcher::Dispatcher;
pub use error::{SidecarError, SidecarResult};

/// Construct a dispatcher, retrying on the backoff schedule while the
/// function container warms up.
///
/// Returns `Ok(None)` when a termination signal interrupts the retry
/// phase. In fail-fast mode (`exit_on_complete`) the first failure is
/// fatal; otherwise exhausting the backoff is.
pub async fn connect_with_retry<F, Fut>(
    mut connect: F,
    mut backoff: Backoff,
    fail_fast: bool,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<Box<dyn Dispatcher>>, SidecarError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Box<dyn Dispatcher>, SidecarError>>,
{
    loop {
        if *shutdown.borrow() {
            return Ok(None);
        }
        match connect().await {
            Ok(dispatcher) => return Ok(Some(dispatcher)),
            Err(error) if fail_fast => return Err(error),
            Err(error) => {
                warn!(%error, "dispatcher connection failed, backing off");
                tokio::select! {
                    may_retry = backoff.backoff() => {
                        if !may_retry {
                            return Err(SidecarError::RetriesExhausted);
                        }
                    }
                    _ = shutdown.changed() => return Ok(None),
                }
            }
        }
    }
}

/// Run the sidecar until a termination signal or end of stream.
pub async fn run(config: Config, mut shutdown: watch::Receiver<bool>) -> SidecarResult<()> {
    let input = config.input()?.to_string();
    let output = config.output()?.map(str::to_string);
    info!(
        group = config.group,
        input,
        output = output.as_deref().unwrap_or("<none>"),
        protocol = ?config.protocol,
        port = config.port,
        "sidecar starting"
    );

    let transport = NatsTransport::connect(&config.brokers).await?;

    // Throughput metrics flow to the broker for the autoscaler to pick up.
    let (metrics, metrics_receiver) = metrics_channel(1024);
    let forwarder = spawn_metrics_forwarder(transport.client().clone(), metrics_receiver);

    let result = async {
        let producer = output
            .is_some()
            .then(|| MetricsEmittingProducer::new(transport.producer(), metrics.clone()));
        let consumer = transport
            .consumer(&config.group, vec![input.clone()])
            .await?;
        let mut consumer = MetricsEmittingConsumer::new(consumer, config.group.clone(), metrics);

        if let Some(delay) = config.initial_delay() {
            info!(?delay, "waiting for function container to initialize");
            tokio::time::sleep(delay).await;
        }

        let dispatcher = connect_with_retry(
            || dispatcher::connect(&config),
            config.backoff()?,
            config.exit_on_complete,
            &mut shutdown,
        )
        .await?;
        let Some(mut dispatcher) = dispatcher else {
            info!("terminated before the dispatcher connected");
            return Ok(None);
        };

        carrier::run(
            &mut consumer,
            producer.as_ref().map(|p| p as &dyn Producer),
            output.as_deref(),
            dispatcher.as_mut(),
            shutdown,
        )
        .await
        .map(Some)
    }
    .await;

    // The block above owned every metrics sender; with them gone the
    // forwarder drains what is queued and exits, whatever path we took.
    let _ = forwarder.await;

    if let Some(exit) = result? {
        info!(?exit, "dispatch loop finished");
    }
    Ok(())
}
