//! In-memory device client

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ClientError;
use crate::{DeviceClient, DeviceId, DeviceInfo, Rgb, Zone};

/// A recorded write
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Leds {
        device: DeviceId,
        colors: Vec<Rgb>,
        fast: bool,
    },
    Led {
        device: DeviceId,
        index: usize,
        color: Rgb,
        fast: bool,
    },
    Zone {
        device: DeviceId,
        zone: usize,
        color: Rgb,
        fast: bool,
    },
}

impl Write {
    pub fn device(&self) -> DeviceId {
        match self {
            Write::Leds { device, .. } | Write::Led { device, .. } | Write::Zone { device, .. } => {
                *device
            }
        }
    }
}

#[derive(Default)]
struct MemoryState {
    devices: Vec<DeviceInfo>,
    writes: Vec<Write>,
    /// Devices whose next write fails
    failing: Vec<DeviceId>,
}

/// Devices held in memory. Writes update the stored colors and are recorded in order.
#[derive(Default)]
pub struct MemoryClient {
    state: Mutex<MemoryState>,
}

impl MemoryClient {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                devices,
                ..Default::default()
            }),
        }
    }

    /// Add a device whose LEDs all start at `color`. Ids are assigned in order.
    pub fn with_device(self, name: &str, led_count: usize, color: Rgb, zones: Vec<Zone>) -> Self {
        {
            let mut state = self.state.lock();
            let id = state.devices.len() as DeviceId;
            state.devices.push(DeviceInfo {
                id,
                name: name.to_string(),
                colors: vec![color; led_count],
                zones,
            });
        }
        self
    }

    /// Current colors of a device
    pub fn colors(&self, device: DeviceId) -> Option<Vec<Rgb>> {
        self.state
            .lock()
            .devices
            .iter()
            .find(|d| d.id == device)
            .map(|d| d.colors.clone())
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Make the next write to `device` fail as if the server went away
    pub fn fail_next_write(&self, device: DeviceId) {
        self.state.lock().failing.push(device);
    }

    fn apply<F>(&self, device: DeviceId, write: Write, f: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut DeviceInfo) -> Result<(), ClientError>,
    {
        let mut state = self.state.lock();
        if let Some(pos) = state.failing.iter().position(|&d| d == device) {
            state.failing.remove(pos);
            return Err(ClientError::Disconnected);
        }
        let info = state
            .devices
            .iter_mut()
            .find(|d| d.id == device)
            .ok_or(ClientError::UnknownDevice(device))?;
        f(info)?;
        state.writes.push(write);
        Ok(())
    }
}

#[async_trait]
impl DeviceClient for MemoryClient {
    async fn devices(&self) -> Result<Vec<DeviceInfo>, ClientError> {
        Ok(self.state.lock().devices.clone())
    }

    async fn update_leds(
        &self,
        device: DeviceId,
        colors: &[Rgb],
        fast: bool,
    ) -> Result<(), ClientError> {
        let write = Write::Leds {
            device,
            colors: colors.to_vec(),
            fast,
        };
        self.apply(device, write, |info| {
            let n = colors.len().min(info.colors.len());
            info.colors[..n].copy_from_slice(&colors[..n]);
            Ok(())
        })
    }

    async fn set_led(
        &self,
        device: DeviceId,
        index: usize,
        color: Rgb,
        fast: bool,
    ) -> Result<(), ClientError> {
        let write = Write::Led {
            device,
            index,
            color,
            fast,
        };
        self.apply(device, write, |info| {
            let count = info.colors.len();
            let slot = info.colors.get_mut(index).ok_or(ClientError::LedOutOfRange {
                device,
                index,
                count,
            })?;
            *slot = color;
            Ok(())
        })
    }

    async fn set_zone(
        &self,
        device: DeviceId,
        zone: usize,
        color: Rgb,
        fast: bool,
    ) -> Result<(), ClientError> {
        let write = Write::Zone {
            device,
            zone,
            color,
            fast,
        };
        self.apply(device, write, |info| {
            let range = info
                .zones
                .get(zone)
                .map(Zone::range)
                .ok_or(ClientError::UnknownZone { device, zone })?;
            let end = range.end.min(info.colors.len());
            for c in &mut info.colors[range.start.min(end)..end] {
                *c = color;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MemoryClient {
        MemoryClient::default().with_device(
            "Keyboard",
            6,
            Rgb::BLACK,
            vec![Zone::new("Main", 0, 4), Zone::new("Logo", 4, 2)],
        )
    }

    #[tokio::test]
    async fn writes_update_colors_and_are_recorded() {
        let client = client();
        client.set_led(0, 1, Rgb::WHITE, false).await.unwrap();
        client.set_zone(0, 1, Rgb::new(0, 0, 255), true).await.unwrap();

        let colors = client.colors(0).unwrap();
        assert_eq!(colors[1], Rgb::WHITE);
        assert_eq!(&colors[4..], &[Rgb::new(0, 0, 255); 2]);
        assert_eq!(client.write_count(), 2);
        assert_eq!(client.writes()[1].device(), 0);
    }

    #[tokio::test]
    async fn bad_targets_are_rejected_without_recording() {
        let client = client();
        assert!(matches!(
            client.set_led(0, 6, Rgb::WHITE, true).await,
            Err(ClientError::LedOutOfRange { count: 6, .. })
        ));
        assert!(matches!(
            client.update_leds(9, &[], true).await,
            Err(ClientError::UnknownDevice(9))
        ));
        assert!(client.set_zone(0, 2, Rgb::WHITE, true).await.is_err());
        assert_eq!(client.write_count(), 0);
    }

    #[tokio::test]
    async fn injected_failure_hits_one_write() {
        let client = client();
        client.fail_next_write(0);
        assert!(matches!(
            client.set_led(0, 0, Rgb::WHITE, false).await,
            Err(ClientError::Disconnected)
        ));
        assert_eq!(client.colors(0).unwrap()[0], Rgb::BLACK);
        client.set_led(0, 0, Rgb::WHITE, false).await.unwrap();
        assert_eq!(client.colors(0).unwrap()[0], Rgb::WHITE);
    }
}
