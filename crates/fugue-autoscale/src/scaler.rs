//! Per-function replica computation.
//!
//! Turns one sampled metrics window into a replica proposal by running the
//! raw throughput ratio through a fixed adjuster pipeline.

use std::time::Duration;

use fugue_transport::Inspector;
use tracing::{debug, warn};

use crate::delayer::Delayer;
use crate::engine::FunctionId;

/// Metric counters accumulated for one (topic, function) pair since the
/// last proposal round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsTotals {
    /// Messages produced to the topic.
    pub transmit_count: u64,
    /// Messages the function's consumer group received from the topic.
    pub receive_count: u64,
}

/// Raw throughput-ratio proposal, before any adjuster runs.
///
/// With nothing received yet the ratio is undefined: no traffic at all
/// proposes zero, while pending production proposes a single replica to
/// start consumption and obtain a measurable rate.
pub fn base_proposal(last_replicas: u32, totals: &MetricsTotals) -> u32 {
    if totals.receive_count == 0 {
        return if totals.transmit_count == 0 { 0 } else { 1 };
    }
    let ratio =
        last_replicas as f64 * totals.transmit_count as f64 / totals.receive_count as f64;
    ratio.ceil() as u32
}

/// Inputs the engine resolves for one evaluation round.
pub(crate) struct EvalContext<'a> {
    pub last_replicas: u32,
    pub max_replicas: u32,
    pub delay_scale_down: Duration,
    pub inspector: &'a dyn Inspector,
    /// Topics the function is currently monitored under.
    pub topics: &'a [String],
}

/// Scaling state for a single monitored function.
///
/// The adjusters run in a fixed order: max-clamp, then the queue-aware
/// floor, then the cooldown gate. Reordering them changes observable
/// behavior (the floor must see the clamped value, and the cooldown must
/// be the last word so a floored 1 can restart its hold window).
pub(crate) struct FunctionScaler {
    function: FunctionId,
    delayer: Delayer,
}

impl FunctionScaler {
    pub(crate) fn new(function: FunctionId) -> Self {
        Self {
            function,
            delayer: Delayer::new(),
        }
    }

    pub(crate) async fn evaluate(&mut self, totals: &MetricsTotals, ctx: EvalContext<'_>) -> u32 {
        let mut proposal = base_proposal(ctx.last_replicas, totals);
        proposal = self.clamp_to_max(proposal, &ctx);
        proposal = self.floor_on_backlog(proposal, &ctx).await;
        self.delayer.delay(proposal, ctx.delay_scale_down)
    }

    fn clamp_to_max(&self, proposal: u32, ctx: &EvalContext<'_>) -> u32 {
        if proposal <= ctx.max_replicas {
            return proposal;
        }
        // Only worth a warning when the clamp actually changes course
        // relative to what is already running.
        if proposal != ctx.last_replicas {
            warn!(
                function = %self.function,
                proposed = proposal,
                max = ctx.max_replicas,
                "clamping replica proposal to policy maximum"
            );
        }
        ctx.max_replicas
    }

    /// Keeps one replica alive while the input queue still has a backlog.
    ///
    /// The floor only prevents scaling to zero; it never initiates a
    /// scale-up from zero, since with no replica running there is no
    /// consumption rate to scale against.
    async fn floor_on_backlog(&self, proposal: u32, ctx: &EvalContext<'_>) -> u32 {
        if proposal != 0 || ctx.last_replicas == 0 {
            return proposal;
        }
        if self.backlog_empty(ctx).await {
            proposal
        } else {
            1
        }
    }

    async fn backlog_empty(&self, ctx: &EvalContext<'_>) -> bool {
        for topic in ctx.topics {
            match ctx.inspector.queue_length(topic, &self.function.name).await {
                Ok(length) if length > 0 => {
                    debug!(
                        function = %self.function,
                        topic,
                        length,
                        "backlog pending, holding one replica"
                    );
                    return false;
                }
                Ok(_) => {}
                Err(error) => {
                    // When the queue cannot be inspected the safe answer
                    // is to assume it is not empty.
                    warn!(
                        function = %self.function,
                        topic,
                        %error,
                        "queue inspection failed, assuming backlog"
                    );
                    return false;
                }
            }
        }
        true
    }
}
