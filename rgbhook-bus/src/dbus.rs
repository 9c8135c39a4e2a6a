//! D-Bus backend (zbus)
//!
//! Match rules are registered with the bus daemon through raw `AddMatch` calls
//! so that `eavesdrop='true'` rules (needed to observe method calls such as
//! `Notify` aimed at another peer) pass through unchanged. Delivered messages
//! are re-checked locally against the filter before they reach a subscriber.
//!
//! Every stream on a connection sees messages pulled in by any rule on that
//! connection. A well-known sender is therefore resolved to its unique owner
//! (`GetNameOwner`, then `NameOwnerChanged`) and signals are compared against it.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use zbus::zvariant::{self, StructureBuilder};

use crate::error::BusError;
use crate::filter::{MatchFilter, RawSignal};
use crate::stream::{MatchGuard, MatchHandle, SignalStream};
use crate::value::Value;
use crate::{reply_value, Bus, BusScope, Connector, MethodCall, SharedBus};

const DAEMON_NAME: &str = "org.freedesktop.DBus";
const DAEMON_PATH: &str = "/org/freedesktop/DBus";

/// Open a connection to the session or system bus
pub async fn connect(scope: BusScope) -> Result<DBusBus, BusError> {
    let conn = match scope {
        BusScope::Session => zbus::Connection::session().await?,
        BusScope::System => zbus::Connection::system().await?,
    };
    info!(
        "Connected to {} bus as {}",
        scope,
        conn.unique_name().map(|n| n.to_string()).unwrap_or_default()
    );
    Ok(DBusBus { scope, conn })
}

/// [`Bus`] over a zbus connection
#[derive(Clone)]
pub struct DBusBus {
    scope: BusScope,
    conn: zbus::Connection,
}

impl DBusBus {
    pub fn connection(&self) -> &zbus::Connection {
        &self.conn
    }
}

async fn daemon_proxy(conn: &zbus::Connection) -> Result<zbus::Proxy<'static>, BusError> {
    let proxy = zbus::Proxy::new_owned(conn.clone(), DAEMON_NAME, DAEMON_PATH, DAEMON_NAME).await?;
    Ok(proxy)
}

async fn add_match(conn: &zbus::Connection, rule: &str) -> Result<(), BusError> {
    daemon_proxy(conn)
        .await?
        .call_method("AddMatch", &(rule,))
        .await
        .map_err(|e| BusError::MatchRule(format!("{rule}: {e}")))?;
    Ok(())
}

/// Rule delivering ownership changes of one well-known name
fn owner_rule(name: &str) -> String {
    format!(
        "type='signal',sender='{DAEMON_NAME}',path='{DAEMON_PATH}',interface='{DAEMON_NAME}',member='NameOwnerChanged',arg0='{name}'"
    )
}

/// Unique name currently owning `name`; `None` when nobody does
async fn name_owner(conn: &zbus::Connection, name: &str) -> Option<String> {
    let proxy = daemon_proxy(conn).await.ok()?;
    let reply: zbus::Result<String> = proxy.call("GetNameOwner", &(name,)).await;
    match reply {
        Ok(owner) => Some(owner),
        Err(e) => {
            debug!(%name, "Name has no owner yet: {e}");
            None
        }
    }
}

/// New owner announced by a `NameOwnerChanged` signal for `name`
fn owner_change<'a>(signal: &'a RawSignal, name: &str) -> Option<Option<&'a str>> {
    if signal.interface != DAEMON_NAME || signal.member != "NameOwnerChanged" {
        return None;
    }
    match signal.args.as_slice() {
        [changed, _, new] if changed.as_str() == Some(name) => {
            Some(new.as_str().filter(|owner| !owner.is_empty()))
        }
        _ => None,
    }
}

struct DBusMatchGuard {
    conn: zbus::Connection,
    rules: Vec<String>,
    task: Option<AbortHandle>,
}

impl MatchGuard for DBusMatchGuard {
    fn release(self: Box<Self>) {
        let DBusMatchGuard { conn, rules, task } = *self;
        if let Some(task) = task {
            task.abort();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(?rules, "No runtime left to remove match rules");
            return;
        };
        runtime.spawn(async move {
            let proxy = match daemon_proxy(&conn).await {
                Ok(proxy) => proxy,
                Err(e) => {
                    debug!(?rules, "RemoveMatch failed: {e}");
                    return;
                }
            };
            for rule in rules {
                if let Err(e) = proxy.call_method("RemoveMatch", &(rule.as_str(),)).await {
                    debug!(%rule, "RemoveMatch failed: {e}");
                }
            }
        });
    }
}

/// Remove rules registered before a later step of `subscribe` failed
fn release_rules(conn: &zbus::Connection, rules: Vec<String>) {
    Box::new(DBusMatchGuard {
        conn: conn.clone(),
        rules,
        task: None,
    })
    .release();
}

#[async_trait]
impl Bus for DBusBus {
    fn scope(&self) -> BusScope {
        self.scope
    }

    async fn subscribe(&self, filter: &MatchFilter) -> Result<SignalStream, BusError> {
        let rule = filter.rule();
        // Attach the local stream first so nothing slips in between AddMatch and the reader.
        let mut messages = zbus::MessageStream::from(&self.conn);
        let mut rules = Vec::with_capacity(2);

        let watched = filter.well_known_sender().map(str::to_string);
        let mut owner = None;
        if let Some(name) = &watched {
            let watch = owner_rule(name);
            add_match(&self.conn, &watch).await?;
            rules.push(watch);
            owner = name_owner(&self.conn, name).await;
            debug!(%name, ?owner, "Resolved sender owner");
        }

        if let Err(e) = add_match(&self.conn, &rule).await {
            release_rules(&self.conn, rules);
            return Err(e);
        }
        debug!(%rule, bus = %self.scope, "Added match rule");
        rules.push(rule.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let local = filter.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("D-Bus stream error: {e}");
                        continue;
                    }
                };
                let Some(signal) = raw_signal(&message) else {
                    continue;
                };
                if let Some(name) = &watched {
                    if let Some(changed) = owner_change(&signal, name) {
                        owner = changed.map(str::to_string);
                        debug!(%name, ?owner, "Sender owner changed");
                    }
                }
                if !local.matches(&signal, owner.as_deref()) {
                    continue;
                }
                if tx.send(signal).is_err() {
                    break;
                }
            }
        });

        let guard = DBusMatchGuard {
            conn: self.conn.clone(),
            rules,
            task: Some(task.abort_handle()),
        };
        Ok(SignalStream::new(rx, MatchHandle::new(rule, guard)))
    }

    async fn call(&self, call: &MethodCall) -> Result<Value, BusError> {
        let failed = |message: String| BusError::CallFailed {
            service: call.service.clone(),
            path: call.path.clone(),
            method: call.method.clone(),
            message,
        };

        let reply = if call.args.is_empty() {
            self.conn
                .call_method(
                    Some(call.service.as_str()),
                    call.path.as_str(),
                    call.interface.as_deref(),
                    call.method.as_str(),
                    &(),
                )
                .await
        } else {
            let mut body = StructureBuilder::new();
            for arg in &call.args {
                body = body.append_field(to_zvariant(arg)?);
            }
            let body = body.build()?;
            self.conn
                .call_method(
                    Some(call.service.as_str()),
                    call.path.as_str(),
                    call.interface.as_deref(),
                    call.method.as_str(),
                    &body,
                )
                .await
        };
        let reply = reply.map_err(|e| failed(e.to_string()))?;

        Ok(reply_value(body_values(&reply)?))
    }
}

/// Opens real D-Bus connections
#[derive(Debug, Default, Clone, Copy)]
pub struct DBusConnector;

#[async_trait]
impl Connector for DBusConnector {
    async fn connect(&self, scope: BusScope) -> Result<SharedBus, BusError> {
        Ok(std::sync::Arc::new(connect(scope).await?))
    }
}

/// Signals, plus method calls seen through an eavesdrop rule
fn raw_signal(message: &zbus::Message) -> Option<RawSignal> {
    use zbus::message::Type;

    if !matches!(message.message_type(), Type::Signal | Type::MethodCall) {
        return None;
    }
    let header = message.header();
    let args = body_values(message).unwrap_or_else(|e| {
        debug!("Dropping undecodable signal body: {e}");
        Vec::new()
    });
    Some(RawSignal {
        sender: header.sender().map(|s| s.to_string()).unwrap_or_default(),
        path: header.path()?.to_string(),
        interface: header.interface()?.to_string(),
        member: header.member()?.to_string(),
        destination: header.destination().map(|d| d.to_string()),
        args,
    })
}

fn body_values(message: &zbus::Message) -> Result<Vec<Value>, BusError> {
    let body = message.body();
    if body.signature().to_string().is_empty() {
        return Ok(Vec::new());
    }
    let fields: zvariant::Structure<'_> = body.deserialize()?;
    fields.fields().iter().map(from_zvariant).collect()
}

fn from_zvariant(value: &zvariant::Value<'_>) -> Result<Value, BusError> {
    use zvariant::Value as Z;

    Ok(match value {
        Z::Bool(v) => Value::Bool(*v),
        Z::U8(v) => Value::Byte(*v),
        Z::I16(v) => Value::Int16(*v),
        Z::U16(v) => Value::UInt16(*v),
        Z::I32(v) => Value::Int32(*v),
        Z::U32(v) => Value::UInt32(*v),
        Z::I64(v) => Value::Int64(*v),
        Z::U64(v) => Value::UInt64(*v),
        Z::F64(v) => Value::Double(*v),
        Z::Str(s) => Value::Str(s.to_string()),
        Z::Signature(s) => Value::Str(s.to_string()),
        Z::ObjectPath(p) => Value::ObjectPath(p.to_string()),
        Z::Value(inner) => from_zvariant(inner)?,
        Z::Array(items) => Value::List(items.iter().map(from_zvariant).collect::<Result<_, _>>()?),
        Z::Structure(fields) => {
            Value::List(fields.fields().iter().map(from_zvariant).collect::<Result<_, _>>()?)
        }
        Z::Dict(dict) => {
            let mut map = std::collections::BTreeMap::new();
            for (key, item) in dict.iter() {
                let key = match key {
                    Z::Str(s) => s.to_string(),
                    other => from_zvariant(other)?.to_string(),
                };
                map.insert(key, from_zvariant(item)?);
            }
            Value::Map(map)
        }
        other => {
            return Err(BusError::Conversion(format!(
                "unsupported D-Bus value of type {}",
                other.value_signature()
            )))
        }
    })
}

fn to_zvariant(value: &Value) -> Result<zvariant::Value<'static>, BusError> {
    use zvariant::Value as Z;

    Ok(match value {
        Value::Bool(v) => Z::Bool(*v),
        Value::Byte(v) => Z::U8(*v),
        Value::Int16(v) => Z::I16(*v),
        Value::UInt16(v) => Z::U16(*v),
        Value::Int32(v) => Z::I32(*v),
        Value::UInt32(v) => Z::U32(*v),
        Value::Int64(v) => Z::I64(*v),
        Value::UInt64(v) => Z::U64(*v),
        Value::Double(v) => Z::F64(*v),
        Value::Str(s) => Z::from(s.clone()),
        Value::ObjectPath(p) => Z::ObjectPath(zvariant::ObjectPath::try_from(p.clone())?),
        // Homogeneous string lists go out as `as`, everything else as `av`.
        Value::List(items) => match items.iter().map(Value::as_str).collect::<Option<Vec<_>>>() {
            Some(strings) if !items.is_empty() => Z::from(
                strings
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<String>>(),
            ),
            _ => Z::from(
                items
                    .iter()
                    .map(|item| to_zvariant(item).map(|v| Z::Value(Box::new(v))))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        },
        Value::Map(map) => {
            let mut dict = HashMap::new();
            for (key, item) in map {
                dict.insert(key.clone(), to_zvariant(item)?);
            }
            Z::from(dict)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPOTIFY: &str = "org.mpris.MediaPlayer2.spotify";

    fn owner_changed(name: &str, old: &str, new: &str) -> RawSignal {
        RawSignal::new(DAEMON_NAME, DAEMON_PATH, DAEMON_NAME, "NameOwnerChanged")
            .with_args(vec![Value::from(name), Value::from(old), Value::from(new)])
    }

    #[test]
    fn owner_rule_watches_one_name() {
        assert_eq!(
            owner_rule(SPOTIFY),
            "type='signal',sender='org.freedesktop.DBus',path='/org/freedesktop/DBus',\
             interface='org.freedesktop.DBus',member='NameOwnerChanged',\
             arg0='org.mpris.MediaPlayer2.spotify'"
        );
    }

    #[test]
    fn owner_changes_are_tracked_per_name() {
        let acquired = owner_changed(SPOTIFY, "", ":1.42");
        assert_eq!(owner_change(&acquired, SPOTIFY), Some(Some(":1.42")));

        let lost = owner_changed(SPOTIFY, ":1.42", "");
        assert_eq!(owner_change(&lost, SPOTIFY), Some(None));

        let other = owner_changed("org.mpris.MediaPlayer2.vlc", "", ":1.50");
        assert_eq!(owner_change(&other, SPOTIFY), None);

        let unrelated = RawSignal::new(":1.42", "/", "org.example", "NameOwnerChanged");
        assert_eq!(owner_change(&unrelated, SPOTIFY), None);
    }
}
