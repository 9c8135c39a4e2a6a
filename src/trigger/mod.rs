//! Triggers: a source of notifications gated by conditions
//!
//! A [`Trigger`] is subscribed with a context, a [`Dispatcher`] and a
//! [`Handler`]. Its source (signal or timer) runs on its own task and sends a
//! [`Notification`] to the dispatcher for every event; the engine delivers
//! notifications one at a time, evaluating conditions and invoking the handler.

pub mod condition;
pub mod lifecycle;
pub mod source;

pub use condition::{Condition, ConditionError};
pub use lifecycle::{Lifecycle, LifecycleError, Phase};
pub use source::{SignalSource, TimerSource, TriggerSource};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rgbhook_bus::{Bus, BusError, MatchHandle, SharedBus};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::context::Context;
use crate::hook::HookError;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Subscribing failed: {0}")]
    Bus(#[from] BusError),

    #[error("Callback for subscription {subscription} failed: {source}")]
    CallbackFailure {
        subscription: SubscriptionId,
        #[source]
        source: Box<HookError>,
    },
}

/// Process-unique subscription id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a handler receives when its trigger fires
#[derive(Debug, Clone)]
pub struct Fired {
    pub subscription: SubscriptionId,
    /// Event context (the subscription context extended with event bindings)
    pub context: Arc<Context>,
}

/// Callback invoked on the dispatcher when a trigger fires
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, fired: Fired) -> Result<(), HookError>;
}

/// One live activation of a trigger source.
///
/// Owns the source task and the bus match registration. Dropping an active
/// subscription cancels it.
pub struct Subscription {
    id: SubscriptionId,
    lifecycle: Arc<Lifecycle>,
    task: Option<AbortHandle>,
    matched: Option<MatchHandle>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriptionId,
        lifecycle: Arc<Lifecycle>,
        task: AbortHandle,
        matched: Option<MatchHandle>,
    ) -> Self {
        Self {
            id,
            lifecycle,
            task: Some(task),
            matched,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    /// Stop the source and release its match rule.
    ///
    /// Idempotent once active; a fired subscription only releases its resources.
    pub fn cancel(&mut self) -> Result<(), LifecycleError> {
        let cancelled = self.lifecycle.cancel()?;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(matched) = self.matched.take() {
            matched.release();
        }
        if cancelled {
            debug!(subscription = %self.id, "Cancelled subscription");
        }
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(e) = self.cancel() {
            trace!(subscription = %self.id, "Dropping subscription: {e}");
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Outcome of delivering one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Handled,
    /// A condition did not hold
    Suppressed,
    /// The subscription was no longer active
    Dropped,
}

/// A source event waiting for the dispatcher
pub struct Notification {
    trigger: Arc<Trigger>,
    bus: SharedBus,
    lifecycle: Arc<Lifecycle>,
    once: bool,
    fired: Fired,
    handler: Arc<dyn Handler>,
}

impl Notification {
    pub fn subscription(&self) -> SubscriptionId {
        self.fired.subscription
    }

    /// Evaluate conditions and run the handler.
    ///
    /// The lifecycle is checked before the conditions and again right before
    /// the handler runs, so cancelled subscriptions never reach their handler.
    pub async fn deliver(self) -> Result<Delivery, TriggerError> {
        let subscription = self.fired.subscription;
        if !self.lifecycle.is_active() {
            trace!(%subscription, "Dropping notification for inactive subscription");
            return Ok(Delivery::Dropped);
        }

        let holds = self
            .trigger
            .conditions_hold(self.bus.as_ref(), &self.fired.context)
            .await;

        let claimed = if self.once {
            self.lifecycle.fire()
        } else {
            self.lifecycle.is_active()
        };
        if !claimed {
            trace!(%subscription, "Subscription ended while evaluating conditions");
            return Ok(Delivery::Dropped);
        }
        if !holds {
            return Ok(Delivery::Suppressed);
        }

        self.handler
            .handle(self.fired)
            .await
            .map_err(|source| TriggerError::CallbackFailure {
                subscription,
                source: Box::new(source),
            })?;
        Ok(Delivery::Handled)
    }
}

/// Sending half of the engine's notification queue
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Dispatcher {
    pub fn channel() -> (Dispatcher, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Dispatcher { tx }, rx)
    }

    /// Queue a notification. False once the engine has stopped.
    fn send(&self, notification: Notification) -> bool {
        self.tx.send(notification).is_ok()
    }
}

/// Everything a source needs to emit notifications for one activation
#[derive(Clone)]
pub(crate) struct Activation {
    trigger: Arc<Trigger>,
    bus: SharedBus,
    context: Arc<Context>,
    dispatcher: Dispatcher,
    handler: Arc<dyn Handler>,
}

impl Activation {
    pub(crate) fn bus(&self) -> &SharedBus {
        &self.bus
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub(crate) fn notify(
        &self,
        lifecycle: &Arc<Lifecycle>,
        subscription: SubscriptionId,
        context: Arc<Context>,
        once: bool,
    ) -> bool {
        self.dispatcher.send(Notification {
            trigger: Arc::clone(&self.trigger),
            bus: Arc::clone(&self.bus),
            lifecycle: Arc::clone(lifecycle),
            once,
            fired: Fired {
                subscription,
                context,
            },
            handler: Arc::clone(&self.handler),
        })
    }
}

/// A trigger source gated by conditions
#[derive(Debug)]
pub struct Trigger {
    source: TriggerSource,
    conditions: Vec<Condition>,
}

impl Trigger {
    pub fn new(source: TriggerSource, conditions: Vec<Condition>) -> Self {
        Self { source, conditions }
    }

    pub fn source(&self) -> &TriggerSource {
        &self.source
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Activate the source; `handler` runs for every event whose conditions hold
    pub async fn subscribe(
        self: &Arc<Self>,
        bus: &SharedBus,
        context: Arc<Context>,
        dispatcher: &Dispatcher,
        handler: Arc<dyn Handler>,
    ) -> Result<Subscription, TriggerError> {
        let activation = Activation {
            trigger: Arc::clone(self),
            bus: Arc::clone(bus),
            context,
            dispatcher: dispatcher.clone(),
            handler,
        };
        self.source.activate(activation).await
    }

    /// True when every condition holds. Failing conditions count as not met.
    pub async fn conditions_hold(&self, bus: &dyn Bus, ctx: &Context) -> bool {
        for condition in &self.conditions {
            match condition.evaluate(bus, ctx).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "Condition not met: {}",
                        condition::describe(condition)
                    );
                    return false;
                }
                Err(e) => {
                    warn!("Condition failed, treating as not met: {e}");
                    return false;
                }
            }
        }
        true
    }
}
