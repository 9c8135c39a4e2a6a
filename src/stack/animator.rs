//! Fixed-rate animation scheduler

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace};

use super::SharedStack;

/// Ticks per second unless configured otherwise
pub const DEFAULT_FREQUENCY: u32 = 240;

/// Pause after a failed device write before ticking again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Re-renders animated overlays at a fixed frequency
pub struct Animator {
    stack: SharedStack,
    period: Duration,
}

impl Animator {
    pub fn new(stack: SharedStack, frequency: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / f64::from(frequency.max(1)));
        Self { stack, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run until the returned task is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(period = ?self.period, "Animator started");
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.stack.tick().await {
                    Ok(0) => {}
                    Ok(written) => trace!(devices = written, "Animation frame written"),
                    Err(e) => {
                        error!("Animation tick failed: {e}");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }
        })
    }
}
