//! Device client error types

use thiserror::Error;

/// Errors that can occur while talking to a device server
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server closed the connection")]
    Disconnected,

    #[error("Bad packet magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("Truncated packet: needed {needed} bytes at offset {offset}, have {len}")]
    Truncated {
        needed: usize,
        offset: usize,
        len: usize,
    },

    #[error("Packet too large: {0} bytes")]
    Oversized(usize),

    #[error("Unknown device {0}")]
    UnknownDevice(u32),

    #[error("Device {device} has no LED {index} ({count} LEDs)")]
    LedOutOfRange {
        device: u32,
        index: usize,
        count: usize,
    },

    #[error("Device {device} has no zone {zone}")]
    UnknownZone { device: u32, zone: usize },
}
