//! Device client abstraction for rgbhook
//!
//! Lighting output goes through the [`DeviceClient`] trait. Backends:
//!
//! - [`OpenRgbClient`]: the OpenRGB SDK network protocol
//! - [`MemoryClient`]: in-memory devices that record every write

pub mod client;
pub mod color;
pub mod error;
pub mod memory;
pub mod protocol;

pub use client::OpenRgbClient;
pub use color::Rgb;
pub use error::ClientError;
pub use memory::{MemoryClient, Write};

use async_trait::async_trait;
use std::ops::Range;
use std::sync::Arc;

/// Device index as assigned by the server
pub type DeviceId = u32;

/// A named, contiguous range of LEDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub name: String,
    pub start: usize,
    pub len: usize,
}

impl Zone {
    pub fn new(name: impl Into<String>, start: usize, len: usize) -> Self {
        Self {
            name: name.into(),
            start,
            len,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.len
    }
}

/// Snapshot of one device as reported by the server
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    /// Current color of every LED
    pub colors: Vec<Rgb>,
    pub zones: Vec<Zone>,
}

impl DeviceInfo {
    pub fn led_count(&self) -> usize {
        self.colors.len()
    }

    pub fn zone(&self, name: &str) -> Option<(usize, &Zone)> {
        self.zones.iter().enumerate().find(|(_, z)| z.name == name)
    }
}

/// The core device client trait - all backends implement this
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Enumerate devices with their current colors and zones
    async fn devices(&self) -> Result<Vec<DeviceInfo>, ClientError>;

    /// Set every LED of a device.
    ///
    /// With `fast` the write does not wait for the device to settle.
    async fn update_leds(
        &self,
        device: DeviceId,
        colors: &[Rgb],
        fast: bool,
    ) -> Result<(), ClientError>;

    /// Set one LED
    async fn set_led(
        &self,
        device: DeviceId,
        index: usize,
        color: Rgb,
        fast: bool,
    ) -> Result<(), ClientError>;

    /// Set every LED of one zone to the same color
    async fn set_zone(
        &self,
        device: DeviceId,
        zone: usize,
        color: Rgb,
        fast: bool,
    ) -> Result<(), ClientError>;
}

/// Shared device client handle
pub type SharedClient = Arc<dyn DeviceClient>;
