//! In-process bus
//!
//! Signals are injected with [`MemoryBus::emit`]; method calls are answered
//! from scripted replies. Used by tests and by `rgbhook check`-style dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::BusError;
use crate::filter::{MatchFilter, RawSignal};
use crate::stream::{MatchGuard, MatchHandle, SignalStream};
use crate::value::Value;
use crate::{reply_value, Bus, BusScope, Connector, MethodCall, SharedBus};

type ReplyKey = (String, String, String);

#[derive(Clone)]
struct ScriptedReply {
    result: Result<Vec<Value>, String>,
    delay: Duration,
}

struct Subscriber {
    filter: MatchFilter,
    tx: mpsc::UnboundedSender<RawSignal>,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    subscribers: BTreeMap<u64, Subscriber>,
    replies: HashMap<ReplyKey, ScriptedReply>,
    calls: Vec<MethodCall>,
    /// Well-known name -> unique owner
    owners: HashMap<String, String>,
}

/// In-memory [`Bus`] implementation
#[derive(Clone)]
pub struct MemoryBus {
    scope: BusScope,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBus {
    pub fn new(scope: BusScope) -> Self {
        Self {
            scope,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Deliver a signal to every matching subscriber. Returns the number of deliveries.
    pub fn emit(&self, signal: RawSignal) -> usize {
        let state = self.state.lock();
        let mut delivered = 0;
        for subscriber in state.subscribers.values() {
            let owner = subscriber
                .filter
                .well_known_sender()
                .and_then(|name| state.owners.get(name))
                .map(String::as_str);
            if subscriber.filter.matches(&signal, owner)
                && subscriber.tx.send(signal.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        trace!(member = %signal.member, delivered, "Emitted signal");
        delivered
    }

    /// Give a well-known name to a unique owner, or release it with `None`
    pub fn set_owner(&self, name: &str, owner: Option<&str>) {
        let mut state = self.state.lock();
        match owner {
            Some(owner) => state.owners.insert(name.to_string(), owner.to_string()),
            None => state.owners.remove(name),
        };
    }

    /// Answer calls to `service path method` with a single value
    pub fn reply(&self, service: &str, path: &str, method: &str, value: Value) {
        self.script(service, path, method, Ok(vec![value]), Duration::ZERO);
    }

    /// Answer calls with several reply values
    pub fn reply_many(&self, service: &str, path: &str, method: &str, values: Vec<Value>) {
        self.script(service, path, method, Ok(values), Duration::ZERO);
    }

    /// Answer calls with a value after a delay
    pub fn reply_after(&self, service: &str, path: &str, method: &str, value: Value, delay: Duration) {
        self.script(service, path, method, Ok(vec![value]), delay);
    }

    /// Fail calls with an error message
    pub fn fail(&self, service: &str, path: &str, method: &str, message: &str) {
        self.script(service, path, method, Err(message.to_string()), Duration::ZERO);
    }

    fn script(
        &self,
        service: &str,
        path: &str,
        method: &str,
        result: Result<Vec<Value>, String>,
        delay: Duration,
    ) {
        self.state.lock().replies.insert(
            (service.to_string(), path.to_string(), method.to_string()),
            ScriptedReply { result, delay },
        );
    }

    /// Every method call issued so far
    pub fn calls(&self) -> Vec<MethodCall> {
        self.state.lock().calls.clone()
    }

    /// Match rules of live subscriptions
    pub fn active_rules(&self) -> Vec<String> {
        self.state
            .lock()
            .subscribers
            .values()
            .map(|s| s.filter.rule())
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

struct MemoryGuard {
    id: u64,
    state: Weak<Mutex<MemoryState>>,
}

impl MatchGuard for MemoryGuard {
    fn release(self: Box<Self>) {
        if let Some(state) = self.state.upgrade() {
            state.lock().subscribers.remove(&self.id);
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    fn scope(&self) -> BusScope {
        self.scope
    }

    async fn subscribe(&self, filter: &MatchFilter) -> Result<SignalStream, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.subscribers.insert(
                id,
                Subscriber {
                    filter: filter.clone(),
                    tx,
                },
            );
            id
        };
        let rule = filter.rule();
        debug!(%rule, id, "Added match rule");
        let guard = MemoryGuard {
            id,
            state: Arc::downgrade(&self.state),
        };
        Ok(SignalStream::new(rx, MatchHandle::new(rule, guard)))
    }

    async fn call(&self, call: &MethodCall) -> Result<Value, BusError> {
        let scripted = {
            let mut state = self.state.lock();
            state.calls.push(call.clone());
            state
                .replies
                .get(&(call.service.clone(), call.path.clone(), call.method.clone()))
                .cloned()
        };
        let Some(reply) = scripted else {
            return Err(BusError::CallFailed {
                service: call.service.clone(),
                path: call.path.clone(),
                method: call.method.clone(),
                message: "org.freedesktop.DBus.Error.ServiceUnknown".to_string(),
            });
        };
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply
            .result
            .map(reply_value)
            .map_err(|message| BusError::CallFailed {
                service: call.service.clone(),
                path: call.path.clone(),
                method: call.method.clone(),
                message,
            })
    }
}

/// Hands out one shared [`MemoryBus`] per scope
#[derive(Clone)]
pub struct MemoryConnector {
    session: MemoryBus,
    system: MemoryBus,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            session: MemoryBus::new(BusScope::Session),
            system: MemoryBus::new(BusScope::System),
        }
    }

    pub fn bus(&self, scope: BusScope) -> &MemoryBus {
        match scope {
            BusScope::Session => &self.session,
            BusScope::System => &self.system,
        }
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, scope: BusScope) -> Result<SharedBus, BusError> {
        Ok(Arc::new(self.bus(scope).clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify_filter() -> MatchFilter {
        MatchFilter {
            interface: Some("org.freedesktop.Notifications".into()),
            member: Some("Notify".into()),
            ..Default::default()
        }
    }

    fn notify_signal() -> RawSignal {
        RawSignal::new(
            ":1.5",
            "/org/freedesktop/Notifications",
            "org.freedesktop.Notifications",
            "Notify",
        )
        .with_args(vec![Value::from("firefox")])
    }

    #[tokio::test]
    async fn emit_reaches_matching_subscribers_only() {
        let bus = MemoryBus::new(BusScope::Session);
        let mut stream = bus.subscribe(&notify_filter()).await.unwrap();

        assert_eq!(bus.emit(notify_signal()), 1);
        let mut other = notify_signal();
        other.member = "ActionInvoked".into();
        assert_eq!(bus.emit(other), 0);

        let received = stream.events.recv().await.unwrap();
        assert_eq!(received.args, vec![Value::from("firefox")]);
    }

    #[tokio::test]
    async fn releasing_handle_removes_rule() {
        let bus = MemoryBus::new(BusScope::Session);
        let stream = bus.subscribe(&notify_filter()).await.unwrap();
        assert_eq!(
            bus.active_rules(),
            vec!["type='signal',interface='org.freedesktop.Notifications',member='Notify'"]
        );

        let (_events, handle) = stream.into_parts();
        assert!(handle.release());
        assert!(!handle.release());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.emit(notify_signal()), 0);
    }

    #[tokio::test]
    async fn sender_filter_follows_the_name_owner() {
        let bus = MemoryBus::new(BusScope::Session);
        let props = MatchFilter {
            interface: Some("org.freedesktop.DBus.Properties".into()),
            member: Some("PropertiesChanged".into()),
            ..Default::default()
        };
        let spotify = MatchFilter {
            sender: Some("org.mpris.MediaPlayer2.spotify".into()),
            ..props.clone()
        };
        let mut any = bus.subscribe(&props).await.unwrap();
        let mut from_spotify = bus.subscribe(&spotify).await.unwrap();
        bus.set_owner("org.mpris.MediaPlayer2.spotify", Some(":1.42"));

        let changed = |sender: &str| {
            RawSignal::new(
                sender,
                "/org/mpris/MediaPlayer2",
                "org.freedesktop.DBus.Properties",
                "PropertiesChanged",
            )
        };

        // Another player: only the unfiltered subscription sees it.
        assert_eq!(bus.emit(changed(":1.50")), 1);
        assert_eq!(any.events.recv().await.unwrap().sender, ":1.50");
        assert!(from_spotify.events.try_recv().is_err());

        assert_eq!(bus.emit(changed(":1.42")), 2);
        assert_eq!(from_spotify.events.recv().await.unwrap().sender, ":1.42");

        bus.set_owner("org.mpris.MediaPlayer2.spotify", None);
        assert_eq!(bus.emit(changed(":1.42")), 1);
    }

    #[tokio::test]
    async fn scripted_replies() {
        let bus = MemoryBus::new(BusScope::System);
        bus.reply("org.example", "/x", "Get", Value::UInt32(3));
        bus.reply_many("org.example", "/x", "Pair", vec![Value::Int32(1), Value::Int32(2)]);
        bus.fail("org.example", "/x", "Broken", "org.example.Error.Nope");

        let get = MethodCall::new("org.example", "/x", "Get");
        assert_eq!(bus.call(&get).await.unwrap(), Value::UInt32(3));

        let pair = MethodCall::new("org.example", "/x", "Pair");
        assert_eq!(
            bus.call(&pair).await.unwrap(),
            Value::List(vec![Value::Int32(1), Value::Int32(2)])
        );

        let broken = MethodCall::new("org.example", "/x", "Broken");
        assert!(matches!(
            bus.call(&broken).await,
            Err(BusError::CallFailed { message, .. }) if message == "org.example.Error.Nope"
        ));

        let unknown = MethodCall::new("org.missing", "/", "Ping");
        assert!(bus.call(&unknown).await.is_err());
        assert_eq!(bus.calls().len(), 4);
    }
}
