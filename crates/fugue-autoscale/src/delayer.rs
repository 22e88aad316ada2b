//! Cooldown gate for scale-down proposals.
//!
//! Prevents rapid oscillation when demand is intermittently low: the gate
//! holds the highest proposal seen within a trailing window and only
//! releases a lower one after the window has elapsed without anything
//! exceeding it. Upward movement always propagates immediately.

use std::time::{Duration, Instant};

struct HighWaterMark {
    value: u32,
    /// When the held value was last proposed (or re-proposed).
    since: Instant,
}

/// Debounces downward replica proposals.
///
/// The window length is supplied per call so the caller can read its
/// delay policy at decision time.
pub struct Delayer {
    held: Option<HighWaterMark>,
}

impl Delayer {
    pub fn new() -> Self {
        Self { held: None }
    }

    /// Feed one proposal through the gate and get the effective output.
    pub fn delay(&mut self, proposal: u32, window: Duration) -> u32 {
        self.delay_at(proposal, window, Instant::now())
    }

    fn delay_at(&mut self, proposal: u32, window: Duration, now: Instant) -> u32 {
        match &mut self.held {
            // A proposal at or above the held value propagates immediately
            // and restarts the window.
            Some(mark) if proposal >= mark.value => {
                mark.value = proposal;
                mark.since = now;
                proposal
            }
            Some(mark) => {
                if now.duration_since(mark.since) >= window {
                    // Nothing exceeded the held value for a full window:
                    // release the lower proposal as the new mark.
                    mark.value = proposal;
                    mark.since = now;
                    proposal
                } else {
                    mark.value
                }
            }
            None => {
                self.held = Some(HighWaterMark {
                    value: proposal,
                    since: now,
                });
                proposal
            }
        }
    }
}

impl Default for Delayer {
    fn default() -> Self {
        Self::new()
    }
}
