//! The autoscaler engine.
//!
//! A background task folds producer and consumer aggregate metrics into
//! per-(topic, function) totals; `propose` samples those totals, resets
//! them, and runs each monitored function's scaler over the window.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use fugue_transport::{
    ConsumerAggregateMetric, Inspector, MetricsReceiver, ProducerAggregateMetric,
};

use crate::error::AutoscaleError;
use crate::scaler::{EvalContext, FunctionScaler, MetricsTotals};

/// Identifies a function known to the platform.
///
/// Namespacing is not supported yet; the name alone is the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId {
    pub name: String,
}

impl FunctionId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Resolves the replica ceiling for a function at decision time.
pub type MaxReplicasPolicy = Arc<dyn Fn(&FunctionId) -> u32 + Send + Sync>;

/// Resolves the scale-down cooldown window for a function at decision time.
pub type DelayScaleDownPolicy = Arc<dyn Fn(&FunctionId) -> Duration + Send + Sync>;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

struct EngineState {
    /// Accumulated counters per topic, per function monitored on it.
    totals: HashMap<String, HashMap<FunctionId, MetricsTotals>>,
    scalers: HashMap<FunctionId, FunctionScaler>,
    /// Replica counts the routing layer reported as actually running.
    replicas: HashMap<FunctionId, u32>,
    max_replicas: MaxReplicasPolicy,
    delay_scale_down: DelayScaleDownPolicy,
}

/// The autoscaling decision engine.
///
/// Lifecycle is `created -> running -> closed`, driven by [`run`] and
/// [`close`]. All other operations work in both `created` and `running`
/// states and fail with [`AutoscaleError::Closed`] afterwards; closing
/// twice is safe.
///
/// [`run`]: Autoscaler::run
/// [`close`]: Autoscaler::close
pub struct Autoscaler {
    state: Arc<Mutex<EngineState>>,
    inspector: Arc<dyn Inspector>,
    lifecycle: AtomicU8,
    shutdown_tx: watch::Sender<bool>,
    // Consumed by the first run() call.
    receiver: std::sync::Mutex<Option<MetricsReceiver>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Autoscaler {
    pub fn new(metrics: MetricsReceiver, inspector: Arc<dyn Inspector>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(EngineState {
                totals: HashMap::new(),
                scalers: HashMap::new(),
                replicas: HashMap::new(),
                max_replicas: Arc::new(|_| u32::MAX),
                delay_scale_down: Arc::new(|_| Duration::ZERO),
            })),
            inspector,
            lifecycle: AtomicU8::new(CREATED),
            shutdown_tx,
            receiver: std::sync::Mutex::new(Some(metrics)),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Installs the policy that caps replica proposals per function.
    ///
    /// The default is effectively unbounded.
    pub async fn set_max_replicas_policy<F>(&self, policy: F) -> Result<(), AutoscaleError>
    where
        F: Fn(&FunctionId) -> u32 + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.state.lock().await.max_replicas = Arc::new(policy);
        Ok(())
    }

    /// Installs the policy that delays scale-down per function.
    ///
    /// The default window is zero, so lower proposals pass through
    /// immediately.
    pub async fn set_delay_scale_down_policy<F>(&self, policy: F) -> Result<(), AutoscaleError>
    where
        F: Fn(&FunctionId) -> Duration + Send + Sync + 'static,
    {
        self.ensure_open()?;
        self.state.lock().await.delay_scale_down = Arc::new(policy);
        Ok(())
    }

    /// Starts the background metric accumulation task.
    ///
    /// Callable once: a second call fails with
    /// [`AutoscaleError::AlreadyRunning`], and a call after [`close`]
    /// fails with [`AutoscaleError::Closed`].
    ///
    /// [`close`]: Autoscaler::close
    pub fn run(&self) -> Result<(), AutoscaleError> {
        self.lifecycle
            .compare_exchange(CREATED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|current| {
                if current == CLOSED {
                    AutoscaleError::Closed
                } else {
                    AutoscaleError::AlreadyRunning
                }
            })?;

        let receiver = self
            .receiver
            .lock()
            .expect("metrics receiver lock poisoned")
            .take()
            .expect("metrics receiver is present until the first run");
        let MetricsReceiver {
            mut producer_metrics,
            mut consumer_metrics,
        } = receiver;

        let state = Arc::clone(&self.state);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    Some(event) = producer_metrics.recv() => {
                        fold_producer_metric(&state, event).await;
                    }
                    Some(event) = consumer_metrics.recv() => {
                        fold_consumer_metric(&state, event).await;
                    }
                    // Both metric channels closed; wait for shutdown so
                    // close() still gets an acknowledged join.
                    else => {
                        let _ = shutdown.changed().await;
                        break;
                    }
                }
            }
            debug!("metric accumulation stopped");
        });
        *self.task.lock().expect("task lock poisoned") = Some(handle);
        Ok(())
    }

    /// Stops the accumulation task and marks the engine closed.
    ///
    /// Waits for the background task to acknowledge before returning.
    /// Closing an already closed engine is a no-op.
    pub async fn close(&self) -> Result<(), AutoscaleError> {
        if self.lifecycle.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Records the replica count the routing layer actually runs for a
    /// function. This, not past proposals, seeds the next ratio.
    pub async fn inform_function_replicas(
        &self,
        function: &FunctionId,
        replicas: u32,
    ) -> Result<(), AutoscaleError> {
        self.ensure_open()?;
        self.state
            .lock()
            .await
            .replicas
            .insert(function.clone(), replicas);
        Ok(())
    }

    /// Registers a (topic, function) pair for monitoring, with zeroed
    /// counters.
    pub async fn start_monitoring(
        &self,
        topic: &str,
        function: &FunctionId,
    ) -> Result<(), AutoscaleError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        {
            let functions = state.totals.entry(topic.to_string()).or_default();
            if functions.contains_key(function) {
                return Err(AutoscaleError::AlreadyMonitoring {
                    topic: topic.to_string(),
                    function: function.clone(),
                });
            }
            functions.insert(function.clone(), MetricsTotals::default());
        }
        state
            .scalers
            .insert(function.clone(), FunctionScaler::new(function.clone()));
        debug!(topic, %function, "monitoring started");
        Ok(())
    }

    /// Deregisters a (topic, function) pair, discarding its counters and
    /// scaling state.
    pub async fn stop_monitoring(
        &self,
        topic: &str,
        function: &FunctionId,
    ) -> Result<(), AutoscaleError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let not_monitoring = || AutoscaleError::NotMonitoring {
            topic: topic.to_string(),
            function: function.clone(),
        };
        let functions = state.totals.get_mut(topic).ok_or_else(not_monitoring)?;
        if functions.remove(function).is_none() {
            return Err(not_monitoring());
        }
        let topic_drained = functions.is_empty();
        if topic_drained {
            state.totals.remove(topic);
        }
        // The scaler goes only once the function is under no topic at all.
        let still_monitored = state
            .totals
            .values()
            .any(|functions| functions.contains_key(function));
        if !still_monitored {
            state.scalers.remove(function);
        }
        debug!(topic, %function, "monitoring stopped");
        Ok(())
    }

    /// Computes the desired replica count for every monitored function
    /// from the metrics accumulated since the previous call, then resets
    /// the counters so the next call sees a fresh window.
    ///
    /// # Panics
    ///
    /// Panics if a function is monitored under more than one topic;
    /// multi-topic functions are not supported.
    pub async fn propose(&self) -> Result<HashMap<FunctionId, u32>, AutoscaleError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;

        // Sample and reset in one step, so a metric folded after this
        // point lands in the next window rather than being lost.
        let mut sampled: Vec<(FunctionId, MetricsTotals, Vec<String>)> = Vec::new();
        let mut seen: HashSet<FunctionId> = HashSet::new();
        for (topic, functions) in state.totals.iter_mut() {
            for (function, totals) in functions.iter_mut() {
                assert!(
                    seen.insert(function.clone()),
                    "function {function} is monitored under multiple topics, which is not supported"
                );
                sampled.push((function.clone(), *totals, vec![topic.clone()]));
                *totals = MetricsTotals::default();
            }
        }

        let EngineState {
            scalers,
            replicas,
            max_replicas,
            delay_scale_down,
            ..
        } = &mut *state;

        let mut proposals = HashMap::with_capacity(sampled.len());
        for (function, totals, topics) in sampled {
            let Some(scaler) = scalers.get_mut(&function) else {
                continue;
            };
            let proposal = scaler
                .evaluate(
                    &totals,
                    EvalContext {
                        last_replicas: replicas.get(&function).copied().unwrap_or(0),
                        max_replicas: (max_replicas)(&function),
                        delay_scale_down: (delay_scale_down)(&function),
                        inspector: self.inspector.as_ref(),
                        topics: &topics,
                    },
                )
                .await;
            proposals.insert(function, proposal);
        }
        Ok(proposals)
    }

    fn ensure_open(&self) -> Result<(), AutoscaleError> {
        if self.lifecycle.load(Ordering::Acquire) == CLOSED {
            return Err(AutoscaleError::Closed);
        }
        Ok(())
    }
}

async fn fold_producer_metric(state: &Mutex<EngineState>, event: ProducerAggregateMetric) {
    let mut state = state.lock().await;
    // Production counts toward every function consuming the topic;
    // metrics for unmonitored topics are dropped.
    if let Some(functions) = state.totals.get_mut(&event.topic) {
        for totals in functions.values_mut() {
            totals.transmit_count += event.count;
        }
    }
}

async fn fold_consumer_metric(state: &Mutex<EngineState>, event: ConsumerAggregateMetric) {
    let mut state = state.lock().await;
    let function = FunctionId::new(event.group.as_str());
    if let Some(functions) = state.totals.get_mut(&event.topic)
        && let Some(totals) = functions.get_mut(&function)
    {
        totals.receive_count += event.count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use fugue_transport::{metrics_channel, MemoryTransport};

    fn engine() -> Autoscaler {
        let (_, receiver) = metrics_channel(16);
        let transport = MemoryTransport::new();
        Autoscaler::new(receiver, Arc::new(transport.inspector()))
    }

    #[tokio::test]
    async fn start_monitoring_rejects_duplicates() {
        let engine = engine();
        let f = FunctionId::new("squarer");
        engine.start_monitoring("numbers", &f).await.unwrap();
        let err = engine.start_monitoring("numbers", &f).await.unwrap_err();
        assert!(matches!(err, AutoscaleError::AlreadyMonitoring { .. }));
    }

    #[tokio::test]
    async fn stop_monitoring_requires_registration() {
        let engine = engine();
        let f = FunctionId::new("squarer");
        let err = engine.stop_monitoring("numbers", &f).await.unwrap_err();
        assert!(matches!(err, AutoscaleError::NotMonitoring { .. }));

        engine.start_monitoring("numbers", &f).await.unwrap();
        engine.stop_monitoring("numbers", &f).await.unwrap();
        let err = engine.stop_monitoring("numbers", &f).await.unwrap_err();
        assert!(matches!(err, AutoscaleError::NotMonitoring { .. }));
    }

    #[tokio::test]
    async fn stopped_function_disappears_from_proposals() {
        let engine = engine();
        let f = FunctionId::new("squarer");
        engine.start_monitoring("numbers", &f).await.unwrap();
        assert!(engine.propose().await.unwrap().contains_key(&f));

        engine.stop_monitoring("numbers", &f).await.unwrap();
        assert!(engine.propose().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scaler_survives_while_monitored_under_another_topic() {
        let engine = engine();
        let f = FunctionId::new("squarer");
        engine.start_monitoring("numbers", &f).await.unwrap();
        engine.start_monitoring("letters", &f).await.unwrap();
        engine.stop_monitoring("numbers", &f).await.unwrap();

        // Back under a single topic, the function keeps being proposed for.
        let proposals = engine.propose().await.unwrap();
        assert_eq!(proposals.get(&f), Some(&0));
    }

    #[tokio::test]
    async fn run_twice_is_an_error() {
        let engine = engine();
        engine.run().unwrap();
        assert!(matches!(
            engine.run().unwrap_err(),
            AutoscaleError::AlreadyRunning
        ));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn closed_engine_rejects_operations() {
        let engine = engine();
        engine.run().unwrap();
        engine.close().await.unwrap();

        let f = FunctionId::new("squarer");
        assert!(matches!(
            engine.start_monitoring("numbers", &f).await.unwrap_err(),
            AutoscaleError::Closed
        ));
        assert!(matches!(
            engine.inform_function_replicas(&f, 1).await.unwrap_err(),
            AutoscaleError::Closed
        ));
        assert!(matches!(engine.propose().await.unwrap_err(), AutoscaleError::Closed));
        assert!(matches!(engine.run().unwrap_err(), AutoscaleError::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let engine = engine();
        engine.run().unwrap();
        engine.close().await.unwrap();
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_without_run_is_fine() {
        let engine = engine();
        engine.close().await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "multiple topics")]
    async fn multi_topic_function_panics_on_propose() {
        let engine = engine();
        let f = FunctionId::new("squarer");
        engine.start_monitoring("numbers", &f).await.unwrap();
        engine.start_monitoring("letters", &f).await.unwrap();
        let _ = engine.propose().await;
    }

    #[tokio::test]
    async fn propose_resets_the_window() {
        let (sender, receiver) = metrics_channel(64);
        let transport = MemoryTransport::new();
        let engine = Autoscaler::new(receiver, Arc::new(transport.inspector()));
        let f = FunctionId::new("squarer");
        engine.start_monitoring("numbers", &f).await.unwrap();
        engine.inform_function_replicas(&f, 1).await.unwrap();
        engine.run().unwrap();

        sender.record_transmit("numbers", 8);
        // Poll until the background task has folded the event.
        let mut proposals = HashMap::new();
        for _ in 0..100 {
            proposals = engine.propose().await.unwrap();
            if proposals.get(&f) == Some(&1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(proposals.get(&f), Some(&1));

        // The window was consumed: with no new traffic the next
        // proposal drops to zero.
        assert_eq!(engine.propose().await.unwrap().get(&f), Some(&0));
        engine.close().await.unwrap();
    }
}
