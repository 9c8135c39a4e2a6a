//! Engine: builds hooks from configuration and runs the dispatcher loop

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use openrgb_client::SharedClient;
use rgbhook_bus::{BusError, BusScope, Connector, SharedBus};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::config::{Config, ConfigError};
use crate::context::Context;
use crate::hook::{Hook, HookError, HookScope};
use crate::stack::{Animator, SharedStack, StackError};
use crate::trigger::{Delivery, Dispatcher, Notification, TriggerError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Device state: {0}")]
    Stack(#[from] StackError),

    #[error("Connecting to the {scope} bus failed: {source}")]
    Bus {
        scope: BusScope,
        #[source]
        source: BusError,
    },

    #[error("Hook '{hook}': {source}")]
    Hook {
        hook: String,
        #[source]
        source: HookError,
    },

    #[error(transparent)]
    Trigger(#[from] TriggerError),
}

/// Hooks, the shared stack and the notification queue
pub struct Engine {
    hooks: Vec<Hook>,
    stack: SharedStack,
    frequency: u32,
    queue: mpsc::UnboundedReceiver<Notification>,
    buses: BTreeMap<BusScope, SharedBus>,
    /// Parent of every hook context
    base: Arc<Context>,
}

impl Engine {
    /// Capture the device baseline, connect the buses the hooks need and build every hook
    pub async fn from_config(
        config: &Config,
        client: SharedClient,
        connector: &dyn Connector,
    ) -> Result<Self, EngineError> {
        let library = config.effect_library()?;
        let plans = config.plans(&library)?;
        let stack = SharedStack::load(client).await?;

        let base = Arc::new(Context::new().with("debug", tracing::enabled!(tracing::Level::DEBUG)));
        let (dispatcher, queue) = Dispatcher::channel();
        let mut buses: BTreeMap<BusScope, SharedBus> = BTreeMap::new();
        let mut hooks = Vec::with_capacity(plans.len());

        for plan in plans {
            let bus = match buses.get(&plan.scope) {
                Some(bus) => Arc::clone(bus),
                None => {
                    let bus = connector
                        .connect(plan.scope)
                        .await
                        .map_err(|source| EngineError::Bus {
                            scope: plan.scope,
                            source,
                        })?;
                    debug!(scope = %plan.scope, "Connected to bus");
                    buses.insert(plan.scope, Arc::clone(&bus));
                    bus
                }
            };
            let context = Arc::new(Context::child(&base).with("hook", plan.name.as_str()));
            let scope = HookScope {
                bus,
                context,
                stack: stack.clone(),
                dispatcher: dispatcher.clone(),
            };
            hooks.push(Hook::new(plan.name, plan.start, plan.end, plan.action, scope));
        }

        Ok(Self {
            hooks,
            stack,
            frequency: config.animation.frequency,
            queue,
            buses,
            base,
        })
    }

    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    pub fn stack(&self) -> &SharedStack {
        &self.stack
    }

    pub fn base_context(&self) -> &Arc<Context> {
        &self.base
    }

    /// Buses the hooks are connected to
    pub fn scopes(&self) -> impl Iterator<Item = BusScope> + '_ {
        self.buses.keys().copied()
    }

    /// Attach every hook and deliver notifications until `shutdown` resolves.
    ///
    /// A failing handler stops the loop. Either way hooks are detached, the
    /// animator stops and device baselines are restored before returning.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), EngineError>
    where
        F: Future<Output = ()>,
    {
        let result = self.serve(shutdown).await;

        let cancelled: usize = self.hooks.iter().map(Hook::detach).sum();
        debug!(cancelled, "Detached hooks");
        let restored = self.stack.restore().await;

        match (result, restored) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e.into()),
            (Ok(()), Ok(())) => {
                info!("Stopped");
                Ok(())
            }
        }
    }

    async fn serve<F>(&mut self, shutdown: F) -> Result<(), EngineError>
    where
        F: Future<Output = ()>,
    {
        for hook in &self.hooks {
            hook.attach().await.map_err(|source| EngineError::Hook {
                hook: hook.name().to_string(),
                source,
            })?;
        }
        info!("{} hooks attached", self.hooks.len());

        let animator = Animator::new(self.stack.clone(), self.frequency).spawn();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break Ok(());
                }
                notification = self.queue.recv() => {
                    let Some(notification) = notification else {
                        break Ok(());
                    };
                    let subscription = notification.subscription();
                    match notification.deliver().await {
                        Ok(Delivery::Handled) => trace!(%subscription, "Notification handled"),
                        Ok(outcome) => trace!(%subscription, ?outcome, "Notification not handled"),
                        Err(e) => {
                            error!("{e}");
                            break Err(e.into());
                        }
                    }
                }
            }
        };

        animator.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openrgb_client::{MemoryClient, Rgb};
    use rgbhook_bus::{MemoryConnector, RawSignal};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn client() -> Arc<MemoryClient> {
        Arc::new(MemoryClient::default().with_device("Strip", 4, Rgb::BLACK, Vec::new()))
    }

    #[tokio::test]
    async fn buses_are_connected_once_per_scope() {
        let config = Config::from_yaml(
            "version: 0.4.0\nhooks:\n  a:\n    trigger: { sleep: 1s }\n    until: { sleep: 1s }\n  b:\n    trigger: { sleep: 1s }\n    until: { sleep: 1s }\n  c:\n    bus: system\n    trigger: { sleep: 1s }\n    until: { sleep: 1s }\n",
        )
        .unwrap();
        let engine = Engine::from_config(&config, client(), &MemoryConnector::new())
            .await
            .unwrap();
        assert_eq!(engine.hooks().len(), 3);
        assert_eq!(
            engine.scopes().collect::<Vec<_>>(),
            vec![BusScope::Session, BusScope::System]
        );
        assert!(engine.base_context().contains("debug"));
    }

    #[tokio::test]
    async fn callback_failure_stops_the_engine() {
        // The action targets an element the device does not have.
        let config = Config::from_yaml(
            "version: 0.4.0\nhooks:\n  broken:\n    action: { type: leds, device_id: 0, leds: [9], color: red }\n    trigger:\n      signal: { interface: org.example.Build, name: Started }\n    until: { sleep: 1s }\n",
        )
        .unwrap();
        let connector = MemoryConnector::new();
        let engine = Engine::from_config(&config, client(), &connector).await.unwrap();

        let (_tx, rx) = oneshot::channel::<()>();
        let run = tokio::spawn(engine.run(async move {
            let _ = rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        connector
            .bus(BusScope::Session)
            .emit(RawSignal::new(":1.2", "/", "org.example.Build", "Started"));

        let result = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert!(matches!(result, Err(EngineError::Trigger(TriggerError::CallbackFailure { .. }))));
        assert!(connector.bus(BusScope::Session).active_rules().is_empty());
    }
}
