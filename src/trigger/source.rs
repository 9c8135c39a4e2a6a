//! Trigger sources: bus signals and timers

use std::sync::Arc;
use std::time::Duration;

use rgbhook_bus::{MatchFilter, RawSignal, Value};
use tracing::{debug, trace};

use super::{Activation, Lifecycle, Subscription, SubscriptionId, TriggerError};
use crate::context::Context;
use crate::template::Template;

/// Where notifications come from
#[derive(Debug, Clone)]
pub enum TriggerSource {
    Signal(SignalSource),
    Timer(TimerSource),
}

impl TriggerSource {
    pub(crate) async fn activate(&self, activation: Activation) -> Result<Subscription, TriggerError> {
        match self {
            TriggerSource::Signal(signal) => signal.activate(activation).await,
            TriggerSource::Timer(timer) => timer.activate(activation),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TriggerSource::Signal(s) => format!("signal {}", s.literal_filter().rule()),
            TriggerSource::Timer(t) => format!("sleep {:?}", t.duration),
        }
    }
}

/// Bus signal subscription with optional positional argument filters
#[derive(Debug, Clone, Default)]
pub struct SignalSource {
    pub sender: Option<Template>,
    pub path: Option<Template>,
    pub interface: Option<Template>,
    pub member: Option<Template>,
    pub destination: Option<Template>,
    pub eavesdrop: bool,
    /// Expected positional arguments; `None` matches anything
    pub arguments: Vec<Option<Template>>,
}

impl SignalSource {
    /// Match filter rendered permissively against the subscription context
    pub fn filter(&self, ctx: &Context) -> MatchFilter {
        let render = |t: &Option<Template>| t.as_ref().map(|t| t.render_permissive(ctx).to_string());
        MatchFilter {
            sender: render(&self.sender),
            path: render(&self.path),
            interface: render(&self.interface),
            member: render(&self.member),
            destination: render(&self.destination),
            eavesdrop: self.eavesdrop,
        }
    }

    fn literal_filter(&self) -> MatchFilter {
        self.filter(&Context::new())
    }

    fn expected_arguments(&self, ctx: &Context) -> Vec<Option<Value>> {
        self.arguments
            .iter()
            .map(|arg| arg.as_ref().map(|t| t.render_permissive(ctx)))
            .collect()
    }

    async fn activate(&self, activation: Activation) -> Result<Subscription, TriggerError> {
        let lifecycle = Arc::new(Lifecycle::default());
        lifecycle.activate()?;
        let id = SubscriptionId::next();

        let filter = self.filter(activation.context());
        let stream = activation.bus().subscribe(&filter).await?;
        let (mut events, matched) = stream.into_parts();
        let expected = self.expected_arguments(activation.context());
        debug!(subscription = %id, rule = %filter.rule(), "Subscribed to signal");

        let task_lifecycle = Arc::clone(&lifecycle);
        let task = tokio::spawn(async move {
            while let Some(signal) = events.recv().await {
                if !task_lifecycle.is_active() {
                    break;
                }
                if let Some(position) = argument_mismatch(&expected, &signal.args) {
                    trace!(subscription = %id, position, member = %signal.member, "Argument filter rejected signal");
                    continue;
                }
                let ctx = Arc::new(signal_context(activation.context(), &signal));
                if !activation.notify(&task_lifecycle, id, ctx, false) {
                    break;
                }
            }
        });

        Ok(Subscription::new(id, lifecycle, task.abort_handle(), Some(matched)))
    }
}

/// First position whose expected argument does not match, if any.
///
/// Only positions present on both sides are compared; expected arguments
/// beyond the end of the signal's arguments are ignored.
fn argument_mismatch(expected: &[Option<Value>], actual: &[Value]) -> Option<usize> {
    expected
        .iter()
        .zip(actual)
        .enumerate()
        .find_map(|(i, (want, got))| match want {
            Some(want) if !got.value_eq(want) => Some(i),
            _ => None,
        })
}

/// Child of the subscription context carrying the event's bindings
pub fn signal_context(parent: &Arc<Context>, signal: &RawSignal) -> Context {
    let mut ctx = Context::child(parent)
        .with("sig_sender", signal.sender.as_str())
        .with("sig_path", signal.path.as_str())
        .with("sig_interface", signal.interface.as_str())
        .with("sig_name", signal.member.as_str())
        .with("sig_member", signal.member.as_str());
    if let Some(destination) = &signal.destination {
        ctx.insert("sig_destination", destination.as_str());
    }
    for (i, arg) in signal.args.iter().enumerate() {
        ctx.insert(format!("sig_arg{i}"), arg.clone());
    }
    ctx
}

/// Fires once, a fixed time after activation
#[derive(Debug, Clone, Copy)]
pub struct TimerSource {
    pub duration: Duration,
}

impl TimerSource {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    fn activate(&self, activation: Activation) -> Result<Subscription, TriggerError> {
        let lifecycle = Arc::new(Lifecycle::default());
        lifecycle.activate()?;
        let id = SubscriptionId::next();
        let duration = self.duration;
        debug!(subscription = %id, ?duration, "Timer armed");

        let task_lifecycle = Arc::clone(&lifecycle);
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if task_lifecycle.is_active() {
                let ctx = Arc::clone(activation.context());
                activation.notify(&task_lifecycle, id, ctx, true);
            }
        });

        Ok(Subscription::new(id, lifecycle, task.abort_handle(), None))
    }
}
