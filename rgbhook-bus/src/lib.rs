//! Notification bus abstraction for rgbhook
//!
//! Hooks talk to the bus through the [`Bus`] trait:
//!
//! - signal subscriptions filtered by a [`MatchFilter`], delivered as [`RawSignal`]s
//! - method calls returning a single [`Value`]
//!
//! Backends:
//!
//! - [`DBusBus`] (feature `dbus`): session or system D-Bus via zbus
//! - [`MemoryBus`]: in-process bus for tests and dry runs

pub mod error;
pub mod filter;
pub mod memory;
pub mod stream;
pub mod value;

#[cfg(feature = "dbus")]
mod dbus;

pub use error::BusError;
pub use filter::{MatchFilter, RawSignal};
pub use memory::{MemoryBus, MemoryConnector};
pub use stream::{MatchGuard, MatchHandle, SignalStream};
pub use value::Value;

#[cfg(feature = "dbus")]
pub use dbus::{connect, DBusBus, DBusConnector};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Which bus a hook talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BusScope {
    Session,
    System,
}

impl BusScope {
    /// Parse a scope name (case-insensitive)
    pub fn from_name(name: &str) -> Result<Self, BusError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(BusScope::Session),
            "system" => Ok(BusScope::System),
            _ => Err(BusError::UnsupportedBusScope(name.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BusScope::Session => "session",
            BusScope::System => "system",
        }
    }
}

impl fmt::Display for BusScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A method call against a remote service
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub service: String,
    pub path: String,
    pub interface: Option<String>,
    pub method: String,
    pub args: Vec<Value>,
}

impl MethodCall {
    pub fn new(
        service: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            path: path.into(),
            interface: None,
            method: method.into(),
            args: Vec::new(),
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

impl fmt::Display for MethodCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ", self.service, self.path)?;
        if let Some(interface) = &self.interface {
            write!(f, "{interface}.")?;
        }
        write!(f, "{}(", self.method)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// The core bus trait - all backends implement this
#[async_trait]
pub trait Bus: Send + Sync {
    /// Scope this connection was opened on
    fn scope(&self) -> BusScope;

    /// Register a match filter and receive every matching signal.
    ///
    /// The registration lives as long as the returned stream's handle.
    async fn subscribe(&self, filter: &MatchFilter) -> Result<SignalStream, BusError>;

    /// Issue a method call and wait for the reply.
    ///
    /// A single reply value is returned as-is, several values as a
    /// [`Value::List`], and an empty reply as an empty list.
    async fn call(&self, call: &MethodCall) -> Result<Value, BusError>;
}

/// Shared bus handle
pub type SharedBus = Arc<dyn Bus>;

/// Opens bus connections by scope
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, scope: BusScope) -> Result<SharedBus, BusError>;
}

/// Collapse reply values into the single result value callers compare against
pub(crate) fn reply_value(mut values: Vec<Value>) -> Value {
    if values.len() == 1 {
        values.remove(0)
    } else {
        Value::List(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_names_are_case_insensitive() {
        assert_eq!(BusScope::from_name("Session").unwrap(), BusScope::Session);
        assert_eq!(BusScope::from_name("SYSTEM").unwrap(), BusScope::System);
        assert!(matches!(
            BusScope::from_name("starter"),
            Err(BusError::UnsupportedBusScope(name)) if name == "starter"
        ));
    }

    #[test]
    fn reply_value_shapes() {
        assert_eq!(reply_value(vec![]), Value::List(vec![]));
        assert_eq!(reply_value(vec![Value::from("x")]), Value::from("x"));
        assert_eq!(
            reply_value(vec![Value::Int32(1), Value::Int32(2)]),
            Value::List(vec![Value::Int32(1), Value::Int32(2)])
        );
    }

    #[test]
    fn method_call_display() {
        let call = MethodCall::new("org.example", "/org/example", "Get")
            .with_interface("org.example.Props")
            .with_args(vec![Value::from("Volume")]);
        assert_eq!(call.to_string(), "org.example /org/example org.example.Props.Get(Volume)");
    }
}
