//! Keyframe effect library
//!
//! Effects are defined in TOML as named keyframe sequences with time,
//! brightness, optional color and easing. Colors may name a `$variable`,
//! bound when an action resolves the effect. A [`ResolvedEffect`] is an
//! [`Animation`] the stack re-renders every tick.
//!
//! ```toml
//! [breathe]
//! color = "$color"
//! keyframes = [
//!     { t = 0,    v = 0.0, easing = "EaseInOutCubic" },
//!     { t = 1200, v = 1.0, easing = "EaseInOutCubic" },
//!     { t = 2400, v = 0.0 },
//!     { t = 3000, v = 0.0 },
//! ]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keyframe::functions as ease;
use keyframe::EasingFunction;
use openrgb_client::Rgb;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stack::Animation;

#[derive(Error, Debug)]
pub enum EffectError {
    #[error("Failed to read effect library {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse effect library: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown effect '{0}'")]
    UnknownEffect(String),

    #[error("Unresolved effect variable ${0}")]
    UnresolvedVariable(String),

    #[error("Invalid color '{0}'")]
    InvalidColor(String),

    #[error("Unknown easing '{0}'")]
    UnknownEasing(String),
}

/// Effect definition as written in TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EffectDef {
    /// Default color, literal or `$variable`
    pub color: Option<String>,
    #[serde(default)]
    pub keyframes: Vec<KeyframeDef>,
    /// Special mode; only "rainbow" is known
    pub mode: Option<String>,
    /// Hue rotations per cycle in rainbow mode
    pub speed: Option<f32>,
    pub description: Option<String>,
}

impl EffectDef {
    /// Variables referenced by the effect, in order of first use
    pub fn variables(&self) -> Vec<String> {
        let mut vars: Vec<String> = Vec::new();
        let colors = self
            .color
            .iter()
            .chain(self.keyframes.iter().filter_map(|kf| kf.color.as_ref()));
        for color in colors {
            if let Some(name) = color.strip_prefix('$') {
                if !vars.iter().any(|v| v == name) {
                    vars.push(name.to_string());
                }
            }
        }
        vars
    }

    pub fn is_animated(&self) -> bool {
        self.keyframes.len() > 1 || self.mode.is_some()
    }
}

/// One keyframe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyframeDef {
    /// Milliseconds from the start of the cycle
    pub t: f64,
    /// Brightness 0.0-1.0
    pub v: f64,
    pub color: Option<String>,
    /// Easing towards the next keyframe
    #[serde(default = "default_easing")]
    pub easing: String,
}

fn default_easing() -> String {
    "Linear".to_string()
}

/// Named effects
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EffectLibrary {
    #[serde(flatten)]
    pub effects: BTreeMap<String, EffectDef>,
}

impl EffectLibrary {
    /// The effects every installation ships with
    pub fn builtin() -> Self {
        Self::from_toml(BUILTIN_EFFECTS_TOML).unwrap_or_default()
    }

    pub fn from_toml(content: &str) -> Result<Self, EffectError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, EffectError> {
        let content = std::fs::read_to_string(path).map_err(|source| EffectError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Add or replace effects from another library
    pub fn extend(&mut self, other: EffectLibrary) {
        self.effects.extend(other.effects);
    }

    pub fn get(&self, name: &str) -> Result<&EffectDef, EffectError> {
        self.effects
            .get(name)
            .ok_or_else(|| EffectError::UnknownEffect(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.effects.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Easing {
    Linear,
    Hold,
    EaseIn,
    EaseOut,
    EaseInOut,
    EaseInCubic,
    EaseOutCubic,
    EaseInOutCubic,
    EaseInQuart,
    EaseOutQuart,
    EaseInOutQuart,
    EaseInQuint,
    EaseOutQuint,
    EaseInOutQuint,
}

impl Easing {
    fn parse(name: &str) -> Result<Self, EffectError> {
        Ok(match name {
            "Linear" => Easing::Linear,
            "Hold" | "Step" => Easing::Hold,
            "EaseIn" | "EaseInQuad" => Easing::EaseIn,
            "EaseOut" | "EaseOutQuad" => Easing::EaseOut,
            "EaseInOut" | "EaseInOutQuad" => Easing::EaseInOut,
            "EaseInCubic" => Easing::EaseInCubic,
            "EaseOutCubic" => Easing::EaseOutCubic,
            "EaseInOutCubic" => Easing::EaseInOutCubic,
            "EaseInQuart" => Easing::EaseInQuart,
            "EaseOutQuart" => Easing::EaseOutQuart,
            "EaseInOutQuart" => Easing::EaseInOutQuart,
            // keyframe has no exponential curves; quintic is the closest
            "EaseInQuint" | "EaseInExpo" => Easing::EaseInQuint,
            "EaseOutQuint" | "EaseOutExpo" => Easing::EaseOutQuint,
            "EaseInOutQuint" | "EaseInOutExpo" => Easing::EaseInOutQuint,
            other => return Err(EffectError::UnknownEasing(other.to_string())),
        })
    }

    fn apply(self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Easing::Linear => t,
            Easing::Hold => 0.0,
            Easing::EaseIn => ease::EaseIn.y(t),
            Easing::EaseOut => ease::EaseOut.y(t),
            Easing::EaseInOut => ease::EaseInOut.y(t),
            Easing::EaseInCubic => ease::EaseInCubic.y(t),
            Easing::EaseOutCubic => ease::EaseOutCubic.y(t),
            Easing::EaseInOutCubic => ease::EaseInOutCubic.y(t),
            Easing::EaseInQuart => ease::EaseInQuart.y(t),
            Easing::EaseOutQuart => ease::EaseOutQuart.y(t),
            Easing::EaseInOutQuart => ease::EaseInOutQuart.y(t),
            Easing::EaseInQuint => ease::EaseInQuint.y(t),
            Easing::EaseOutQuint => ease::EaseOutQuint.y(t),
            Easing::EaseInOutQuint => ease::EaseInOutQuint.y(t),
        }
    }
}

#[derive(Debug, Clone)]
struct ResolvedKeyframe {
    t_ms: f64,
    color: Rgb,
    brightness: f64,
    easing: Easing,
}

/// Effect with every variable bound to a concrete color
#[derive(Debug, Clone)]
pub struct ResolvedEffect {
    keyframes: Vec<ResolvedKeyframe>,
    cycle_ms: f64,
    rainbow: Option<f32>,
}

impl ResolvedEffect {
    /// Bind `vars` (names without `$`) into a definition
    pub fn resolve(def: &EffectDef, vars: &BTreeMap<String, Rgb>) -> Result<Self, EffectError> {
        let rainbow = (def.mode.as_deref() == Some("rainbow")).then(|| def.speed.unwrap_or(1.0));

        let keyframes = if def.keyframes.is_empty() {
            vec![ResolvedKeyframe {
                t_ms: 0.0,
                color: resolve_color(def.color.as_deref(), vars)?,
                brightness: 1.0,
                easing: Easing::Linear,
            }]
        } else {
            def.keyframes
                .iter()
                .map(|kf| {
                    Ok(ResolvedKeyframe {
                        t_ms: kf.t.max(0.0),
                        color: resolve_color(kf.color.as_deref().or(def.color.as_deref()), vars)?,
                        brightness: kf.v.clamp(0.0, 1.0),
                        easing: Easing::parse(&kf.easing)?,
                    })
                })
                .collect::<Result<Vec<_>, EffectError>>()?
        };
        let cycle_ms = keyframes.last().map_or(0.0, |kf| kf.t_ms);

        Ok(Self {
            keyframes,
            cycle_ms,
            rainbow,
        })
    }

    /// Color at `elapsed_ms` from the start of the effect
    pub fn evaluate(&self, elapsed_ms: f64) -> Rgb {
        let t = if self.cycle_ms > 0.0 {
            elapsed_ms % self.cycle_ms
        } else {
            0.0
        };
        let brightness = self.brightness_at(t);

        if let Some(speed) = self.rainbow {
            let phase = if self.cycle_ms > 0.0 { t / self.cycle_ms } else { 0.0 };
            let hue = (phase * 360.0 * f64::from(speed)) as f32;
            return Rgb::from_hsv(hue, 1.0, brightness as f32);
        }
        self.color_at(t).scale(brightness as f32)
    }

    fn brightness_at(&self, t: f64) -> f64 {
        match self.segment(t) {
            Some((a, b, local)) => a.brightness + (b.brightness - a.brightness) * a.easing.apply(local),
            None => self.keyframes.last().map_or(1.0, |kf| kf.brightness),
        }
    }

    fn color_at(&self, t: f64) -> Rgb {
        match self.segment(t) {
            Some((a, _, _)) if a.easing == Easing::Hold => a.color,
            Some((a, b, local)) => Rgb::lerp(a.color, b.color, local as f32),
            None => self.keyframes.last().map_or(Rgb::BLACK, |kf| kf.color),
        }
    }

    /// Surrounding keyframes and the position between them
    fn segment(&self, t: f64) -> Option<(&ResolvedKeyframe, &ResolvedKeyframe, f64)> {
        self.keyframes.windows(2).find_map(|pair| {
            let (a, b) = (&pair[0], &pair[1]);
            if t >= b.t_ms {
                return None;
            }
            let span = b.t_ms - a.t_ms;
            let local = if span > 0.0 { (t - a.t_ms) / span } else { 0.0 };
            Some((a, b, local.clamp(0.0, 1.0)))
        })
    }
}

impl Animation for ResolvedEffect {
    fn render(&self, elapsed: Duration) -> Rgb {
        self.evaluate(elapsed.as_secs_f64() * 1000.0)
    }
}

fn resolve_color(color: Option<&str>, vars: &BTreeMap<String, Rgb>) -> Result<Rgb, EffectError> {
    let Some(s) = color else {
        return Ok(Rgb::BLACK);
    };
    match s.strip_prefix('$') {
        Some(name) => vars
            .get(name)
            .copied()
            .ok_or_else(|| EffectError::UnresolvedVariable(name.to_string())),
        None => Rgb::parse(s).ok_or_else(|| EffectError::InvalidColor(s.to_string())),
    }
}

pub const BUILTIN_EFFECTS_TOML: &str = r##"# Effects available to every configuration.
# `$name` colors are bound from the action's vars; a user library can redefine any of these.

[breathe]
color = "$color"
description = "Cubic swell and fade with a dark pause between breaths"
keyframes = [
    { t = 0,    v = 0.0, easing = "EaseInOutCubic" },
    { t = 1200, v = 1.0, easing = "EaseInOutCubic" },
    { t = 2400, v = 0.0 },
    { t = 3000, v = 0.0 },
]

[flash]
color = "$color"
description = "Short on beat, long off beat"
keyframes = [
    { t = 0,   v = 1.0, easing = "Hold" },
    { t = 300, v = 0.0, easing = "Hold" },
    { t = 900, v = 1.0 },
]

[pulse]
color = "$color"
description = "Fast attack, fading tail, then rest"
keyframes = [
    { t = 0,    v = 0.0, easing = "EaseOutCubic" },
    { t = 120,  v = 1.0, easing = "EaseOutCubic" },
    { t = 1000, v = 0.0 },
    { t = 1500, v = 0.0 },
]

[solid]
color = "$color"
description = "Steady color"

[police]
description = "Red and blue strobes separated by short gaps"
keyframes = [
    { t = 0,   color = "red",  v = 1.0, easing = "Hold" },
    { t = 120, color = "red",  v = 0.0, easing = "Hold" },
    { t = 180, color = "blue", v = 1.0, easing = "Hold" },
    { t = 300, color = "blue", v = 0.0, easing = "Hold" },
    { t = 360, color = "red",  v = 1.0 },
]

[rainbow]
mode = "rainbow"
speed = 1.0
description = "One turn of the hue wheel every four seconds"
keyframes = [
    { t = 0,    v = 1.0 },
    { t = 4000, v = 1.0 },
]
"##;
