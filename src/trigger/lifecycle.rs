//! Subscription lifecycle state

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Subscription is already active")]
    AlreadyActive,

    #[error("Subscription was never activated")]
    NotActive,

    #[error("Subscription already finished ({0})")]
    Finished(Phase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Inactive = 0,
    Active = 1,
    Fired = 2,
    Cancelled = 3,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Phase::Active,
            2 => Phase::Fired,
            3 => Phase::Cancelled,
            _ => Phase::Inactive,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Inactive => "inactive",
            Phase::Active => "active",
            Phase::Fired => "fired",
            Phase::Cancelled => "cancelled",
        })
    }
}

/// Atomic lifecycle shared between a subscription, its source task and the dispatcher.
///
/// `Inactive -> Active -> {Fired | Cancelled}`; both end states are terminal.
#[derive(Debug)]
pub struct Lifecycle {
    phase: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Inactive as u8),
        }
    }
}

impl Lifecycle {
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.phase() == Phase::Active
    }

    fn transition(&self, from: Phase, to: Phase) -> Result<(), Phase> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Phase::from_u8)
    }

    pub fn activate(&self) -> Result<(), LifecycleError> {
        match self.transition(Phase::Inactive, Phase::Active) {
            Ok(()) => Ok(()),
            Err(Phase::Active) => Err(LifecycleError::AlreadyActive),
            Err(other) => Err(LifecycleError::Finished(other)),
        }
    }

    /// Cancel an active lifecycle.
    ///
    /// Returns `Ok(false)` when it had already fired or been cancelled.
    pub fn cancel(&self) -> Result<bool, LifecycleError> {
        match self.transition(Phase::Active, Phase::Cancelled) {
            Ok(()) => Ok(true),
            Err(Phase::Inactive) => Err(LifecycleError::NotActive),
            Err(_) => Ok(false),
        }
    }

    /// Claim the single firing of a once-only source. False if no longer active.
    pub fn fire(&self) -> bool {
        self.transition(Phase::Active, Phase::Fired).is_ok()
    }
}
