//! Hooks: start trigger applies an action, end trigger resets it

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rgbhook_bus::SharedBus;
use thiserror::Error;
use tracing::{debug, info};

use crate::action::{Action, ActionError};
use crate::context::Context;
use crate::stack::{Cookie, SharedStack};
use crate::trigger::{
    Dispatcher, Fired, Handler, LifecycleError, Subscription, SubscriptionId, Trigger, TriggerError,
};

#[derive(Error, Debug)]
pub enum HookError {
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// What a hook runs against: one bus, one context, the shared stack and the dispatcher
#[derive(Clone)]
pub struct HookScope {
    pub bus: SharedBus,
    pub context: Arc<Context>,
    pub stack: SharedStack,
    pub dispatcher: Dispatcher,
}

#[derive(Default)]
struct Subscriptions {
    attached: bool,
    start: Option<Subscription>,
    /// End subscriptions waiting to reset their overlay
    pending: HashMap<SubscriptionId, (Subscription, Cookie)>,
}

struct HookInner {
    name: String,
    start: Arc<Trigger>,
    end: Arc<Trigger>,
    action: Action,
    scope: HookScope,
    subscriptions: Mutex<Subscriptions>,
}

/// A start trigger, an end trigger and the action between them
#[derive(Clone)]
pub struct Hook {
    inner: Arc<HookInner>,
}

impl Hook {
    pub fn new(
        name: impl Into<String>,
        start: Trigger,
        end: Trigger,
        action: Action,
        scope: HookScope,
    ) -> Self {
        Self {
            inner: Arc::new(HookInner {
                name: name.into(),
                start: Arc::new(start),
                end: Arc::new(end),
                action,
                scope,
                subscriptions: Mutex::new(Subscriptions::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn action(&self) -> &Action {
        &self.inner.action
    }

    pub fn is_attached(&self) -> bool {
        self.inner.subscriptions.lock().attached
    }

    /// End triggers currently waiting to fire
    pub fn pending_count(&self) -> usize {
        self.inner.subscriptions.lock().pending.len()
    }

    /// Subscribe the start trigger
    pub async fn attach(&self) -> Result<(), HookError> {
        {
            let mut subs = self.inner.subscriptions.lock();
            if subs.attached {
                return Err(LifecycleError::AlreadyActive.into());
            }
            subs.attached = true;
        }

        let handler = Arc::new(StartHandler {
            hook: Arc::downgrade(&self.inner),
        });
        let scope = &self.inner.scope;
        let subscription = match self
            .inner
            .start
            .subscribe(&scope.bus, Arc::clone(&scope.context), &scope.dispatcher, handler)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                self.inner.subscriptions.lock().attached = false;
                return Err(e.into());
            }
        };

        debug!(hook = %self.inner.name, subscription = %subscription.id(), "Attached hook");
        self.inner.subscriptions.lock().start = Some(subscription);
        Ok(())
    }

    /// Cancel the start subscription and every pending end subscription.
    ///
    /// Returns how many subscriptions were cancelled. Safe to call repeatedly.
    pub fn detach(&self) -> usize {
        let (start, pending) = {
            let mut subs = self.inner.subscriptions.lock();
            subs.attached = false;
            (subs.start.take(), std::mem::take(&mut subs.pending))
        };

        let mut cancelled = 0;
        for mut subscription in start.into_iter().chain(pending.into_values().map(|(s, _)| s)) {
            if subscription.cancel().is_ok() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(hook = %self.inner.name, cancelled, "Detached hook");
        }
        cancelled
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.inner.name)
            .field("attached", &self.is_attached())
            .field("pending", &self.pending_count())
            .finish()
    }
}

struct StartHandler {
    hook: Weak<HookInner>,
}

#[async_trait]
impl Handler for StartHandler {
    async fn handle(&self, fired: Fired) -> Result<(), HookError> {
        let Some(hook) = self.hook.upgrade() else {
            return Ok(());
        };
        let scope = &hook.scope;
        let cookie = hook.action.act(&fired.context, &scope.stack).await?;
        info!("Hook '{}' activated", hook.name);

        let end = Arc::new(EndHandler {
            hook: Arc::downgrade(&hook),
            cookie,
        });
        let subscription = hook
            .end
            .subscribe(&scope.bus, Arc::clone(&fired.context), &scope.dispatcher, end)
            .await?;

        let mut subs = hook.subscriptions.lock();
        if subs.attached {
            subs.pending.insert(subscription.id(), (subscription, cookie));
        } else {
            // Detached while the action ran; the dropped subscription cancels itself.
            debug!(hook = %hook.name, %cookie, "Hook detached before its end trigger was armed");
        }
        Ok(())
    }
}

struct EndHandler {
    hook: Weak<HookInner>,
    cookie: Cookie,
}

#[async_trait]
impl Handler for EndHandler {
    async fn handle(&self, fired: Fired) -> Result<(), HookError> {
        let Some(hook) = self.hook.upgrade() else {
            return Ok(());
        };
        let entry = hook.subscriptions.lock().pending.remove(&fired.subscription);
        if let Some((mut subscription, _)) = entry {
            subscription.cancel()?;
        }
        hook.action.reset(self.cookie, &hook.scope.stack).await?;
        info!("Hook '{}' halted", hook.name);
        Ok(())
    }
}
