//! Shared stack handle: stack mutation and device writes under one lock

use std::sync::Arc;

use openrgb_client::{DeviceId, Rgb, SharedClient};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Cookie, DeviceStateStack, Frame, Layouts, Overlay, StackError};

/// Handle to the stack every action and the animator share.
///
/// Frames are written while the lock is held, so the colors on a device
/// always reflect the latest overlay list.
#[derive(Clone)]
pub struct SharedStack {
    stack: Arc<Mutex<DeviceStateStack>>,
    client: SharedClient,
    layouts: Arc<Layouts>,
}

impl SharedStack {
    pub fn new(stack: DeviceStateStack, client: SharedClient) -> Self {
        let layouts = Arc::new(stack.layouts());
        Self {
            stack: Arc::new(Mutex::new(stack)),
            client,
            layouts,
        }
    }

    /// Capture the baseline from the client's current device colors
    pub async fn load(client: SharedClient) -> Result<Self, StackError> {
        let devices = client.devices().await?;
        debug!(devices = devices.len(), "Captured device baseline");
        Ok(Self::new(DeviceStateStack::new(devices), client))
    }

    pub fn layouts(&self) -> &Layouts {
        &self.layouts
    }

    /// Push an overlay and write the affected devices.
    ///
    /// If a write fails the overlay is taken off again before the error is
    /// returned, since the caller never receives its cookie.
    pub async fn push(&self, overlay: Overlay) -> Result<Cookie, StackError> {
        let mut stack = self.stack.lock().await;
        let (cookie, frames) = stack.push(overlay, Instant::now())?;
        if let Err(e) = self.write(&mut stack, frames, false).await {
            match stack.remove(cookie, Instant::now()) {
                Ok(frames) => {
                    if let Err(undo) = self.write(&mut stack, frames, false).await {
                        debug!(%cookie, "Rolling back overlay: {undo}");
                    }
                }
                Err(undo) => debug!(%cookie, "Rolling back overlay: {undo}"),
            }
            return Err(e);
        }
        Ok(cookie)
    }

    pub async fn remove(&self, cookie: Cookie) -> Result<(), StackError> {
        let mut stack = self.stack.lock().await;
        let frames = stack.remove(cookie, Instant::now())?;
        self.write(&mut stack, frames, false).await
    }

    /// One animation step; returns the number of devices written
    pub async fn tick(&self) -> Result<usize, StackError> {
        let mut stack = self.stack.lock().await;
        let frames = stack.tick(Instant::now())?;
        let written = frames.len();
        self.write(&mut stack, frames, true).await?;
        Ok(written)
    }

    pub async fn resolve(&self, device: DeviceId) -> Result<Vec<Rgb>, StackError> {
        self.stack.lock().await.resolve(device, Instant::now())
    }

    pub async fn is_animated(&self) -> bool {
        self.stack.lock().await.is_animated()
    }

    pub async fn len(&self) -> usize {
        self.stack.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.stack.lock().await.is_empty()
    }

    /// Drop every overlay and write the baselines back
    pub async fn restore(&self) -> Result<(), StackError> {
        let mut stack = self.stack.lock().await;
        let live = stack.len();
        let frames = stack.clear(Instant::now())?;
        if live > 0 {
            debug!(overlays = live, "Restoring device baselines");
        }
        self.write(&mut stack, frames, false).await
    }

    /// Write every frame. A device whose write fails is invalidated so its
    /// next render goes out again; the first error is returned at the end.
    async fn write(
        &self,
        stack: &mut DeviceStateStack,
        frames: Vec<Frame>,
        fast: bool,
    ) -> Result<(), StackError> {
        let mut failed = None;
        for frame in frames {
            if let Err(e) = self.client.update_leds(frame.device, &frame.colors, fast).await {
                warn!(device = frame.device, "Device write failed: {e}");
                stack.invalidate(frame.device);
                failed.get_or_insert(e);
            }
        }
        match failed {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{Animation, Paint};
    use openrgb_client::{MemoryClient, Write};
    use std::time::Duration;

    const RED: Rgb = Rgb::new(255, 0, 0);

    /// Milliseconds since push, in the blue channel
    #[derive(Debug)]
    struct Millis;

    impl Animation for Millis {
        fn render(&self, elapsed: Duration) -> Rgb {
            Rgb::new(0, 0, elapsed.as_millis().min(255) as u8)
        }
    }

    async fn two_strips() -> (Arc<MemoryClient>, SharedStack) {
        let client = Arc::new(
            MemoryClient::default()
                .with_device("Desk", 2, Rgb::BLACK, Vec::new())
                .with_device("Shelf", 2, Rgb::BLACK, Vec::new()),
        );
        let stack = SharedStack::load(client.clone()).await.unwrap();
        (client, stack)
    }

    async fn shared() -> (Arc<MemoryClient>, SharedStack) {
        let client = Arc::new(MemoryClient::default().with_device("Strip", 4, Rgb::BLACK, Vec::new()));
        let stack = SharedStack::load(client.clone()).await.unwrap();
        (client, stack)
    }

    #[tokio::test]
    async fn push_and_remove_write_through() {
        let (client, stack) = shared().await;
        let mut overlay = Overlay::new();
        overlay.set(0, 1, Paint::Solid(RED));

        let cookie = stack.push(overlay).await.unwrap();
        assert_eq!(client.colors(0).unwrap()[1], RED);

        stack.remove(cookie).await.unwrap();
        assert_eq!(client.colors(0).unwrap(), vec![Rgb::BLACK; 4]);
        assert!(client
            .writes()
            .iter()
            .all(|w| matches!(w, Write::Leds { fast: false, .. })));
    }

    #[tokio::test]
    async fn restore_writes_baseline() {
        let (client, stack) = shared().await;
        let mut overlay = Overlay::new();
        overlay.set_all(0, 0..4, Paint::Solid(RED));
        stack.push(overlay).await.unwrap();

        stack.restore().await.unwrap();
        assert!(stack.is_empty().await);
        assert_eq!(client.colors(0).unwrap(), vec![Rgb::BLACK; 4]);
    }

    #[tokio::test]
    async fn tick_without_animation_writes_nothing() {
        let (client, stack) = shared().await;
        client.clear_writes();
        assert_eq!(stack.tick().await.unwrap(), 0);
        assert_eq!(client.write_count(), 0);
    }

    #[tokio::test]
    async fn failed_push_leaves_no_overlay_behind() {
        let (client, stack) = two_strips().await;
        client.fail_next_write(0);
        let mut overlay = Overlay::new();
        overlay.set(0, 0, Paint::Solid(RED));
        overlay.set(1, 0, Paint::Solid(RED));

        assert!(matches!(stack.push(overlay).await, Err(StackError::Client(_))));
        assert!(stack.is_empty().await);
        for device in [0, 1] {
            assert_eq!(client.colors(device).unwrap(), vec![Rgb::BLACK; 2]);
            assert_eq!(stack.resolve(device).await.unwrap(), vec![Rgb::BLACK; 2]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_still_writes_other_devices_and_retries() {
        let (client, stack) = two_strips().await;
        let mut overlay = Overlay::new();
        overlay.set(0, 0, Paint::Animated(Arc::new(Millis)));
        overlay.set(1, 0, Paint::Animated(Arc::new(Millis)));
        stack.push(overlay).await.unwrap();

        tokio::time::advance(Duration::from_millis(10)).await;
        client.fail_next_write(0);
        assert!(stack.tick().await.is_err());
        assert_eq!(client.colors(1).unwrap(), stack.resolve(1).await.unwrap());
        assert_ne!(client.colors(0).unwrap(), stack.resolve(0).await.unwrap());

        // Same instant: only the device that failed is written again.
        client.clear_writes();
        assert_eq!(stack.tick().await.unwrap(), 1);
        assert_eq!(client.writes()[0].device(), 0);
        assert_eq!(client.colors(0).unwrap(), stack.resolve(0).await.unwrap());
    }
}
