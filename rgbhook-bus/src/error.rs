//! Bus error types

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to a notification bus
#[derive(Error, Debug)]
pub enum BusError {
    #[error("Unsupported bus scope '{0}' (expected 'session' or 'system')")]
    UnsupportedBusScope(String),

    #[error("Bus connection failed: {0}")]
    Connection(String),

    #[error("Method call {service} {path} {method} failed: {message}")]
    CallFailed {
        service: String,
        path: String,
        method: String,
        message: String,
    },

    #[error("Method call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cannot convert value: {0}")]
    Conversion(String),

    #[error("Match rule rejected: {0}")]
    MatchRule(String),

    #[error("Bus closed")]
    Closed,
}

#[cfg(feature = "dbus")]
impl From<zbus::Error> for BusError {
    fn from(e: zbus::Error) -> Self {
        BusError::Connection(e.to_string())
    }
}

#[cfg(feature = "dbus")]
impl From<zbus::zvariant::Error> for BusError {
    fn from(e: zbus::zvariant::Error) -> Self {
        BusError::Conversion(e.to_string())
    }
}
