//! State overlays: partial desired colors per device and element

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use openrgb_client::{DeviceId, Rgb};
use thiserror::Error;

/// Time-varying color source, re-rendered every animation tick
pub trait Animation: Send + Sync + fmt::Debug {
    /// Color at `elapsed` since the overlay was pushed
    fn render(&self, elapsed: Duration) -> Rgb;
}

/// What an overlay puts on one element
#[derive(Debug, Clone)]
pub enum Paint {
    Solid(Rgb),
    Animated(Arc<dyn Animation>),
}

impl Paint {
    pub fn color_at(&self, elapsed: Duration) -> Rgb {
        match self {
            Paint::Solid(color) => *color,
            Paint::Animated(animation) => animation.render(elapsed),
        }
    }

    pub fn is_animated(&self) -> bool {
        matches!(self, Paint::Animated(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Paint::Solid(_) => "static",
            Paint::Animated(_) => "animated",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Incompatible state merge on device {device} element {index}: {outer} over {inner}")]
pub struct IncompatibleStateMerge {
    pub device: DeviceId,
    pub index: usize,
    pub outer: &'static str,
    pub inner: &'static str,
}

/// Partial device state: absent elements defer to the overlay below
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    devices: BTreeMap<DeviceId, BTreeMap<usize, Paint>>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, device: DeviceId, index: usize, paint: Paint) {
        self.devices.entry(device).or_default().insert(index, paint);
    }

    pub fn set_all(&mut self, device: DeviceId, indices: impl IntoIterator<Item = usize>, paint: Paint) {
        let cells = self.devices.entry(device).or_default();
        for index in indices {
            cells.insert(index, paint.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.values().all(BTreeMap::is_empty)
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.keys().copied()
    }

    pub fn cells(&self, device: DeviceId) -> Option<&BTreeMap<usize, Paint>> {
        self.devices.get(&device)
    }

    pub fn get(&self, device: DeviceId, index: usize) -> Option<&Paint> {
        self.devices.get(&device)?.get(&index)
    }

    pub fn is_animated(&self) -> bool {
        self.devices.values().flat_map(BTreeMap::values).any(Paint::is_animated)
    }

    pub(crate) fn into_devices(self) -> BTreeMap<DeviceId, BTreeMap<usize, Paint>> {
        self.devices
    }

    /// Deep-merge an inner overlay into this (outer) one.
    ///
    /// Device keys and element sets unify. Where both define an element, the
    /// inner value wins if the kinds agree; static vs animated is an error.
    pub fn merge(mut self, inner: Overlay) -> Result<Overlay, IncompatibleStateMerge> {
        for (device, cells) in inner.devices {
            let outer = self.devices.entry(device).or_default();
            for (index, paint) in cells {
                if let Some(existing) = outer.get(&index) {
                    if existing.is_animated() != paint.is_animated() {
                        return Err(IncompatibleStateMerge {
                            device,
                            index,
                            outer: existing.kind(),
                            inner: paint.kind(),
                        });
                    }
                }
                outer.insert(index, paint);
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Blink;

    impl Animation for Blink {
        fn render(&self, elapsed: Duration) -> Rgb {
            if elapsed.as_millis() % 1000 < 500 {
                Rgb::WHITE
            } else {
                Rgb::BLACK
            }
        }
    }

    #[test]
    fn merge_unifies_devices_and_elements() {
        let mut outer = Overlay::new();
        outer.set(0, 0, Paint::Solid(Rgb::new(1, 0, 0)));
        let mut inner = Overlay::new();
        inner.set(0, 1, Paint::Solid(Rgb::new(2, 0, 0)));
        inner.set(1, 0, Paint::Solid(Rgb::new(3, 0, 0)));

        let merged = outer.merge(inner).unwrap();
        assert_eq!(merged.devices().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(merged.cells(0).unwrap().len(), 2);
    }

    #[test]
    fn merge_same_kind_inner_wins() {
        let mut outer = Overlay::new();
        outer.set(0, 0, Paint::Solid(Rgb::new(1, 0, 0)));
        let mut inner = Overlay::new();
        inner.set(0, 0, Paint::Solid(Rgb::new(2, 0, 0)));

        let merged = outer.merge(inner).unwrap();
        assert_eq!(merged.get(0, 0).unwrap().color_at(Duration::ZERO), Rgb::new(2, 0, 0));
    }

    #[test]
    fn merge_static_with_animated_fails() {
        let mut outer = Overlay::new();
        outer.set(2, 5, Paint::Animated(Arc::new(Blink)));
        let mut inner = Overlay::new();
        inner.set(2, 5, Paint::Solid(Rgb::WHITE));

        let err = outer.merge(inner).unwrap_err();
        assert_eq!((err.device, err.index), (2, 5));
        assert_eq!((err.outer, err.inner), ("animated", "static"));
    }

    #[test]
    fn animated_paint_renders_over_time() {
        let paint = Paint::Animated(Arc::new(Blink));
        assert_eq!(paint.color_at(Duration::from_millis(100)), Rgb::WHITE);
        assert_eq!(paint.color_at(Duration::from_millis(700)), Rgb::BLACK);
    }
}
