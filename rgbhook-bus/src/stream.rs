//! Signal streams and their match registrations

use std::fmt;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::filter::RawSignal;

/// Backend-specific teardown of one match registration
pub trait MatchGuard: Send + Sync {
    /// Remove the local filter and the bus-side match rule
    fn release(self: Box<Self>);
}

/// Owner of one match registration. Releasing is idempotent and also happens on drop.
pub struct MatchHandle {
    rule: String,
    guard: Mutex<Option<Box<dyn MatchGuard>>>,
}

impl MatchHandle {
    pub fn new(rule: impl Into<String>, guard: impl MatchGuard + 'static) -> Self {
        Self {
            rule: rule.into(),
            guard: Mutex::new(Some(Box::new(guard))),
        }
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }

    pub fn is_released(&self) -> bool {
        self.guard.lock().is_none()
    }

    /// Release the registration. Returns false if it was already released.
    pub fn release(&self) -> bool {
        let guard = self.guard.lock().take();
        match guard {
            Some(guard) => {
                debug!(rule = %self.rule, "Releasing match rule");
                guard.release();
                true
            }
            None => false,
        }
    }
}

impl Drop for MatchHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchHandle")
            .field("rule", &self.rule)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Matching signals for one subscription plus the handle that keeps it registered
#[derive(Debug)]
pub struct SignalStream {
    pub events: mpsc::UnboundedReceiver<RawSignal>,
    pub handle: MatchHandle,
}

impl SignalStream {
    pub fn new(events: mpsc::UnboundedReceiver<RawSignal>, handle: MatchHandle) -> Self {
        Self { events, handle }
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<RawSignal>, MatchHandle) {
        (self.events, self.handle)
    }
}
