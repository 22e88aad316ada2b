//! fugue-autoscale — the autoscaling decision engine.
//!
//! The [`Autoscaler`] accumulates per-topic throughput metrics in the
//! background and, on each [`propose`](Autoscaler::propose) call, turns the
//! sampled window into a desired replica count per monitored function:
//!
//! ```text
//! base proposal     ceil(last_replicas * transmitted / received)
//!                   (0 with no traffic, 1 while nothing consumes yet)
//! max-clamp         never above the per-function policy maximum
//! min-floor         never to zero while the input queue has a backlog
//! cooldown          scale-down held for the per-function delay window
//! ```
//!
//! The platform's routing layer applies proposals externally and reports
//! the replica counts actually running via
//! [`inform_function_replicas`](Autoscaler::inform_function_replicas).

pub mod delayer;
pub mod engine;
pub mod error;
pub mod scaler;

pub use delayer::Delayer;
pub use engine::{Autoscaler, DelayScaleDownPolicy, FunctionId, MaxReplicasPolicy};
pub use error::{AutoscaleError, AutoscaleResult};
pub use scaler::MetricsTotals;
