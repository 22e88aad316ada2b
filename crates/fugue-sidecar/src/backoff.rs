//! Exponential backoff with a hard retry cap.
//!
//! Used while the function container boots: dispatcher connections fail
//! fast and are retried on this schedule until the cap is reached, at
//! which point the caller must treat the condition as fatal rather than
//! loop forever.

use std::time::Duration;

use crate::error::SidecarError;

pub struct Backoff {
    delay: Duration,
    multiplier: u32,
    max_retries: u32,
    retries: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_retries: u32, multiplier: u32) -> Result<Self, SidecarError> {
        if base.is_zero() {
            return Err(SidecarError::InvalidBackoff("base duration must be > 0"));
        }
        if max_retries == 0 {
            return Err(SidecarError::InvalidBackoff("max retries must be > 0"));
        }
        if multiplier == 0 {
            return Err(SidecarError::InvalidBackoff("multiplier must be > 0"));
        }
        Ok(Self {
            delay: base,
            multiplier,
            max_retries,
            retries: 0,
        })
    }

    /// Sleep for the next step of the schedule and report whether the
    /// caller may retry. The first call sleeps the base duration; each
    /// later call multiplies the delay first. Once the retry cap is
    /// reached this returns `false` without sleeping.
    pub async fn backoff(&mut self) -> bool {
        if self.retries > 0 {
            self.delay *= self.multiplier;
        }
        self.retries += 1;
        if self.retries > self.max_retries {
            return false;
        }
        tokio::time::sleep(self.delay).await;
        true
    }
}
