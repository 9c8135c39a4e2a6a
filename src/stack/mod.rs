//! Device state stack: per-device overlay stacks over a captured baseline.
//!
//! Every pushed [`Overlay`] becomes one layer on each device it touches and is
//! addressed by a random [`Cookie`]. The color of an element is taken from the
//! newest layer that defines it, else from the baseline captured when the stack
//! was built. Layers can be removed in any order.

pub mod animator;
pub mod overlay;
pub mod shared;

pub use animator::{Animator, DEFAULT_FREQUENCY};
pub use overlay::{Animation, IncompatibleStateMerge, Overlay, Paint};
pub use shared::SharedStack;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;

use openrgb_client::{ClientError, DeviceId, DeviceInfo, Rgb, Zone};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum StackError {
    #[error("Overlay cookie {0} is already live")]
    CookieCollision(Cookie),

    #[error("Unknown overlay cookie {0}")]
    UnknownCookie(Cookie),

    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("Device {device} has no element {index} ({count} elements)")]
    ElementOutOfRange {
        device: DeviceId,
        index: usize,
        count: usize,
    },

    #[error("Device {device} element {index} has no baseline color")]
    UndefinedElement { device: DeviceId, index: usize },

    #[error("Device write failed: {0}")]
    Client(#[from] ClientError),
}

/// Handle for removing exactly one pushed overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cookie(u64);

impl Cookie {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Element count and zones of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLayout {
    pub id: DeviceId,
    pub name: String,
    pub element_count: usize,
    pub zones: Vec<Zone>,
}

impl DeviceLayout {
    pub fn zone(&self, name: &str) -> Option<Range<usize>> {
        self.zones
            .iter()
            .find(|z| z.name.eq_ignore_ascii_case(name))
            .map(Zone::range)
    }
}

/// Layouts of every device the stack manages
#[derive(Debug, Clone, Default)]
pub struct Layouts {
    devices: BTreeMap<DeviceId, DeviceLayout>,
}

impl Layouts {
    pub fn device(&self, id: DeviceId) -> Option<&DeviceLayout> {
        self.devices.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceLayout> {
        self.devices.values()
    }
}

/// Colors to write to one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub device: DeviceId,
    pub colors: Vec<Rgb>,
}

struct Layer {
    cookie: Cookie,
    cells: Vec<Option<Paint>>,
    pushed_at: Instant,
    animated: bool,
}

struct DeviceState {
    layout: DeviceLayout,
    baseline: Vec<Rgb>,
    /// Oldest first
    layers: Vec<Layer>,
    /// Colors last handed out for writing; `None` forces the next render out
    written: Option<Vec<Rgb>>,
}

impl DeviceState {
    fn is_animated(&self) -> bool {
        self.layers.iter().any(|l| l.animated)
    }

    fn resolve(&self, now: Instant) -> Result<Vec<Rgb>, StackError> {
        (0..self.layout.element_count)
            .map(|index| {
                let top = self.layers.iter().rev().find_map(|layer| {
                    layer.cells[index]
                        .as_ref()
                        .map(|paint| paint.color_at(now.saturating_duration_since(layer.pushed_at)))
                });
                match top {
                    Some(color) => Ok(color),
                    None => self.baseline.get(index).copied().ok_or(StackError::UndefinedElement {
                        device: self.layout.id,
                        index,
                    }),
                }
            })
            .collect()
    }

    /// Resolve and return a frame only if it differs from the last one written
    fn render(&mut self, now: Instant) -> Result<Option<Frame>, StackError> {
        let colors = self.resolve(now)?;
        if self.written.as_ref() == Some(&colors) {
            return Ok(None);
        }
        self.written = Some(colors.clone());
        Ok(Some(Frame {
            device: self.layout.id,
            colors,
        }))
    }
}

/// Per-device overlay stacks
pub struct DeviceStateStack {
    devices: BTreeMap<DeviceId, DeviceState>,
    /// Live cookies and the devices each one touches
    owners: HashMap<Cookie, Vec<DeviceId>>,
}

impl DeviceStateStack {
    /// Capture layouts and baseline colors from a device listing
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        let devices = devices
            .into_iter()
            .map(|info| {
                let layout = DeviceLayout {
                    id: info.id,
                    name: info.name,
                    element_count: info.colors.len(),
                    zones: info.zones,
                };
                let state = DeviceState {
                    layout,
                    written: Some(info.colors.clone()),
                    baseline: info.colors,
                    layers: Vec::new(),
                };
                (info.id, state)
            })
            .collect();
        Self {
            devices,
            owners: HashMap::new(),
        }
    }

    pub fn layouts(&self) -> Layouts {
        Layouts {
            devices: self
                .devices
                .iter()
                .map(|(&id, state)| (id, state.layout.clone()))
                .collect(),
        }
    }

    /// Push with a fresh random cookie
    pub fn push(&mut self, overlay: Overlay, now: Instant) -> Result<(Cookie, Vec<Frame>), StackError> {
        let cookie = Cookie::random();
        let frames = self.push_with_cookie(cookie, overlay, now)?;
        Ok((cookie, frames))
    }

    /// Push under a caller-chosen cookie; returns the frames to write.
    ///
    /// Validation happens before anything changes, so a failed push leaves the stack untouched.
    pub fn push_with_cookie(
        &mut self,
        cookie: Cookie,
        overlay: Overlay,
        now: Instant,
    ) -> Result<Vec<Frame>, StackError> {
        if self.owners.contains_key(&cookie) {
            return Err(StackError::CookieCollision(cookie));
        }
        for device in overlay.devices() {
            let state = self.devices.get(&device).ok_or(StackError::UnknownDevice(device))?;
            let count = state.layout.element_count;
            if let Some((&index, _)) = overlay
                .cells(device)
                .and_then(|cells| cells.range(count..).next())
            {
                return Err(StackError::ElementOutOfRange {
                    device,
                    index,
                    count,
                });
            }
        }

        let mut touched = Vec::new();
        for (device, cells) in overlay.into_devices() {
            if cells.is_empty() {
                continue;
            }
            let Some(state) = self.devices.get_mut(&device) else {
                continue;
            };
            let mut layer_cells = vec![None; state.layout.element_count];
            let mut animated = false;
            for (index, paint) in cells {
                animated |= paint.is_animated();
                layer_cells[index] = Some(paint);
            }
            state.layers.push(Layer {
                cookie,
                cells: layer_cells,
                pushed_at: now,
                animated,
            });
            touched.push(device);
        }
        debug!(%cookie, devices = ?touched, "Pushed overlay");
        self.owners.insert(cookie, touched.clone());
        self.render_devices(&touched, now)
    }

    /// Remove one overlay wherever it sits; returns the frames to write
    pub fn remove(&mut self, cookie: Cookie, now: Instant) -> Result<Vec<Frame>, StackError> {
        let devices = self
            .owners
            .remove(&cookie)
            .ok_or(StackError::UnknownCookie(cookie))?;
        for device in &devices {
            if let Some(state) = self.devices.get_mut(device) {
                state.layers.retain(|layer| layer.cookie != cookie);
            }
        }
        debug!(%cookie, devices = ?devices, "Removed overlay");
        self.render_devices(&devices, now)
    }

    /// Effective colors of one device
    pub fn resolve(&self, device: DeviceId, now: Instant) -> Result<Vec<Rgb>, StackError> {
        self.devices
            .get(&device)
            .ok_or(StackError::UnknownDevice(device))?
            .resolve(now)
    }

    /// Re-render animated devices; frames only for those whose colors changed
    pub fn tick(&mut self, now: Instant) -> Result<Vec<Frame>, StackError> {
        let mut frames = Vec::new();
        for state in self.devices.values_mut().filter(|s| s.is_animated()) {
            if let Some(frame) = state.render(now)? {
                frames.push(frame);
            }
        }
        if !frames.is_empty() {
            trace!(devices = frames.len(), "Animation tick");
        }
        Ok(frames)
    }

    /// Drop every overlay; frames restore the baselines
    pub fn clear(&mut self, now: Instant) -> Result<Vec<Frame>, StackError> {
        self.owners.clear();
        let mut frames = Vec::new();
        for state in self.devices.values_mut() {
            state.layers.clear();
            if let Some(frame) = state.render(now)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Forget what was last written so the next render goes out again
    pub fn invalidate(&mut self, device: DeviceId) {
        if let Some(state) = self.devices.get_mut(&device) {
            state.written = None;
        }
    }

    /// Number of layers on a device
    pub fn depth(&self, device: DeviceId) -> usize {
        self.devices.get(&device).map_or(0, |s| s.layers.len())
    }

    /// Number of live overlays
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn is_animated(&self) -> bool {
        self.devices.values().any(DeviceState::is_animated)
    }

    fn render_devices(&mut self, devices: &[DeviceId], now: Instant) -> Result<Vec<Frame>, StackError> {
        let mut frames = Vec::new();
        for device in devices {
            if let Some(state) = self.devices.get_mut(device) {
                if let Some(frame) = state.render(now)? {
                    frames.push(frame);
                }
            }
        }
        Ok(frames)
    }
}
