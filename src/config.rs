//! Declarative configuration
//!
//! A configuration file maps hook names to a bus scope, an action chain, a
//! start trigger and an end trigger. Files ending in `.yaml`/`.yml` are read
//! as YAML, everything else as TOML. Unknown keys are rejected everywhere.
//!
//! ```yaml
//! version: 0.4.0
//! hooks:
//!   build:
//!     bus: session
//!     action: { type: leds, device_id: 0, leds: [0, 1], color: [255, 0, 0] }
//!     trigger:
//!       signal: { interface: org.example.Build, name: Started }
//!     until:
//!       sleep: 5s
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use openrgb_client::DeviceId;
use regex::Regex;
use rgbhook_bus::{BusError, BusScope};
use serde::Deserialize;
use thiserror::Error;

use crate::action::{
    Action, ActionKind, EffectAction, EffectTarget, FillAction, LedsAction, ZoneAction,
};
use crate::effect::{EffectError, EffectLibrary};
use crate::stack::DEFAULT_FREQUENCY;
use crate::template::Template;
use crate::trigger::{condition, Condition, SignalSource, TimerSource, Trigger, TriggerSource};

/// Newest configuration version this build understands
pub const SUPPORTED_VERSION: &str = "0.4.0";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_CLIENT_NAME: &str = "rgbhook";

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

static UNKNOWN_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"unknown field `([^`]*)`").unwrap_or_else(|e| unreachable!("unknown field pattern: {e}"))
});

static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*(ms|s|m|h)\s*$").unwrap_or_else(|e| unreachable!("duration pattern: {e}"))
});

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown configuration key '{key}': {message}")]
    UnknownConfigurationKey { key: String, message: String },

    #[error("Invalid configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration version '{0}'")]
    InvalidVersion(String),

    #[error("Configuration version {found} is newer than the supported {supported}")]
    UnsupportedVersion { found: String, supported: &'static str },

    #[error("Invalid log level '{0}' (expected one of error, warn, info, debug, trace)")]
    InvalidLogLevel(String),

    #[error("Invalid duration '{0}' (expected <integer><ms|s|m|h>)")]
    InvalidDuration(String),

    #[error("Animation frequency must be positive")]
    InvalidFrequency,

    #[error("Hook '{hook}': {field} needs exactly one of 'signal' or 'sleep'")]
    TriggerSource { hook: String, field: &'static str },

    #[error("Hook '{hook}': give either 'action' or 'actions', not both")]
    ActionChain { hook: String },

    #[error("Hook '{hook}': effect action takes at most one of 'leds' or 'zone'")]
    EffectTarget { hook: String },

    #[error("Hook '{hook}': {source}")]
    Bus {
        hook: String,
        #[source]
        source: BusError,
    },

    #[error("Hook '{hook}': {source}")]
    Effect {
        hook: String,
        #[source]
        source: EffectError,
    },

    #[error("Effect library: {0}")]
    EffectLibrary(#[from] EffectError),
}

impl ConfigError {
    /// Classify a serde message, pulling out the offending key if there is one
    fn from_message(message: String) -> Self {
        match UNKNOWN_FIELD.captures(&message).and_then(|c| c.get(1)) {
            Some(key) => ConfigError::UnknownConfigurationKey {
                key: key.as_str().to_string(),
                message,
            },
            None => ConfigError::Parse(message),
        }
    }
}

/// Version string; YAML readers may hand over `0.4` as a number
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum VersionRepr {
    Text(String),
    Number(f64),
}

fn deserialize_version<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match VersionRepr::deserialize(d)? {
        VersionRepr::Text(s) => s,
        VersionRepr::Number(n) => n.to_string(),
    })
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: String,
    /// Log level: error, warn, info, debug or trace
    pub logging: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub animation: AnimationConfig,
    /// Extra effect library, relative to the configuration file
    pub effects: Option<PathBuf>,
    #[serde(default)]
    pub hooks: BTreeMap<String, HookConfig>,
    #[serde(skip)]
    source_dir: Option<PathBuf>,
}

/// OpenRGB server connection
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    openrgb_client::protocol::DEFAULT_PORT
}
fn default_client_name() -> String {
    DEFAULT_CLIENT_NAME.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_name: default_client_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnimationConfig {
    /// Ticks per second
    #[serde(default = "default_frequency")]
    pub frequency: u32,
}

fn default_frequency() -> u32 {
    DEFAULT_FREQUENCY
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            frequency: default_frequency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookConfig {
    #[serde(default = "default_bus")]
    pub bus: String,
    pub action: Option<ActionConfig>,
    pub actions: Option<Vec<ActionConfig>>,
    pub trigger: TriggerConfig,
    pub until: TriggerConfig,
}

fn default_bus() -> String {
    "session".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    pub signal: Option<SignalConfig>,
    /// `<integer><ms|s|m|h>`
    pub sleep: Option<String>,
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalConfig {
    pub sender: Option<Template>,
    pub path: Option<Template>,
    pub interface: Option<Template>,
    pub name: Option<Template>,
    pub destination: Option<Template>,
    #[serde(default)]
    pub eavesdrop: bool,
    /// Expected positional arguments; null matches anything
    #[serde(default)]
    pub arguments: Vec<Option<Template>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionConfig {
    pub service_name: Template,
    pub path: Template,
    pub interface: Option<Template>,
    pub method: Template,
    pub response: Template,
    #[serde(default)]
    pub arguments: Vec<Template>,
    pub signature: Option<String>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum ActionConfig {
    Leds {
        device_id: DeviceId,
        leds: Vec<usize>,
        color: Template,
    },
    Zone {
        device_id: DeviceId,
        zone: String,
        color: Template,
    },
    Fill {
        device_id: DeviceId,
        color: Template,
    },
    Effect {
        device_id: DeviceId,
        leds: Option<Vec<usize>>,
        zone: Option<String>,
        effect: String,
        #[serde(default)]
        vars: BTreeMap<String, Template>,
    },
}

/// A hook ready to be built against a bus and a stack
#[derive(Debug)]
pub struct HookPlan {
    pub name: String,
    pub scope: BusScope,
    pub start: Trigger,
    pub end: Trigger,
    pub action: Action,
}

impl Config {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        let mut config = if yaml {
            Self::from_yaml(&content)?
        } else {
            Self::from_toml(&content)?
        };
        config.source_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ConfigError::from_message(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::from_message(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let found = parse_version(&self.version)?;
        let supported = parse_version(SUPPORTED_VERSION)?;
        if found > supported {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version.clone(),
                supported: SUPPORTED_VERSION,
            });
        }
        self.log_level()?;
        if self.animation.frequency == 0 {
            return Err(ConfigError::InvalidFrequency);
        }
        Ok(())
    }

    /// Configured log level, lowercased
    pub fn log_level(&self) -> Result<Option<String>, ConfigError> {
        self.logging
            .as_deref()
            .map(|level| {
                let lower = level.trim().to_ascii_lowercase();
                if LOG_LEVELS.contains(&lower.as_str()) {
                    Ok(lower)
                } else {
                    Err(ConfigError::InvalidLogLevel(level.to_string()))
                }
            })
            .transpose()
    }

    /// Built-in effects plus the configured extra library
    pub fn effect_library(&self) -> Result<EffectLibrary, ConfigError> {
        let mut library = EffectLibrary::builtin();
        if let Some(path) = &self.effects {
            let path = match &self.source_dir {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path.clone(),
            };
            library.extend(EffectLibrary::load(&path)?);
        }
        Ok(library)
    }

    /// Build every hook's triggers and action chain
    pub fn plans(&self, library: &EffectLibrary) -> Result<Vec<HookPlan>, ConfigError> {
        self.hooks
            .iter()
            .map(|(name, hook)| hook.plan(name, library))
            .collect()
    }
}

impl HookConfig {
    fn plan(&self, name: &str, library: &EffectLibrary) -> Result<HookPlan, ConfigError> {
        let scope = BusScope::from_name(&self.bus).map_err(|source| ConfigError::Bus {
            hook: name.to_string(),
            source,
        })?;

        let declared: Vec<&ActionConfig> = match (&self.action, &self.actions) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::ActionChain {
                    hook: name.to_string(),
                })
            }
            (Some(action), None) => vec![action],
            (None, Some(actions)) => actions.iter().collect(),
            (None, None) => Vec::new(),
        };
        let kinds = declared
            .into_iter()
            .map(|a| a.build(name, library))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(HookPlan {
            name: name.to_string(),
            scope,
            start: self.trigger.build(name, "trigger")?,
            end: self.until.build(name, "until")?,
            action: Action::chain(kinds),
        })
    }
}

impl TriggerConfig {
    fn build(&self, hook: &str, field: &'static str) -> Result<Trigger, ConfigError> {
        let source = match (&self.signal, &self.sleep) {
            (Some(signal), None) => TriggerSource::Signal(SignalSource {
                sender: signal.sender.clone(),
                path: signal.path.clone(),
                interface: signal.interface.clone(),
                member: signal.name.clone(),
                destination: signal.destination.clone(),
                eavesdrop: signal.eavesdrop,
                arguments: signal.arguments.clone(),
            }),
            (None, Some(sleep)) => TriggerSource::Timer(TimerSource::new(parse_duration(sleep)?)),
            _ => {
                return Err(ConfigError::TriggerSource {
                    hook: hook.to_string(),
                    field,
                })
            }
        };
        let conditions = self
            .conditions
            .iter()
            .map(ConditionConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Trigger::new(source, conditions))
    }
}

impl ConditionConfig {
    fn build(&self) -> Result<Condition, ConfigError> {
        Ok(Condition {
            service: self.service_name.clone(),
            path: self.path.clone(),
            interface: self.interface.clone(),
            method: self.method.clone(),
            response: self.response.clone(),
            arguments: self.arguments.clone(),
            signature: self.signature.clone(),
            timeout: match &self.timeout {
                Some(t) => parse_duration(t)?,
                None => condition::DEFAULT_TIMEOUT,
            },
        })
    }
}

impl ActionConfig {
    fn build(&self, hook: &str, library: &EffectLibrary) -> Result<ActionKind, ConfigError> {
        Ok(match self {
            ActionConfig::Leds {
                device_id,
                leds,
                color,
            } => ActionKind::Leds(LedsAction {
                device: *device_id,
                leds: leds.clone(),
                color: color.clone(),
            }),
            ActionConfig::Zone {
                device_id,
                zone,
                color,
            } => ActionKind::Zone(ZoneAction {
                device: *device_id,
                zone: zone.clone(),
                color: color.clone(),
            }),
            ActionConfig::Fill { device_id, color } => ActionKind::Fill(FillAction {
                device: *device_id,
                color: color.clone(),
            }),
            ActionConfig::Effect {
                device_id,
                leds,
                zone,
                effect,
                vars,
            } => {
                let target = match (leds, zone) {
                    (Some(_), Some(_)) => {
                        return Err(ConfigError::EffectTarget {
                            hook: hook.to_string(),
                        })
                    }
                    (Some(leds), None) => EffectTarget::Leds(leds.clone()),
                    (None, Some(zone)) => EffectTarget::Zone(zone.clone()),
                    (None, None) => EffectTarget::All,
                };
                let def = library.get(effect).map_err(|source| ConfigError::Effect {
                    hook: hook.to_string(),
                    source,
                })?;
                ActionKind::Effect(EffectAction {
                    device: *device_id,
                    target,
                    name: effect.clone(),
                    effect: Arc::new(def.clone()),
                    vars: vars.clone(),
                })
            }
        })
    }
}

/// Parse `<integer><unit>` with unit ms, s, m or h
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(text.to_string());
    let caps = DURATION.captures(text).ok_or_else(invalid)?;
    let amount: u64 = caps[1].parse().map_err(|_| invalid())?;
    let millis = match &caps[2] {
        "ms" => Some(amount),
        "s" => amount.checked_mul(1_000),
        "m" => amount.checked_mul(60_000),
        "h" => amount.checked_mul(3_600_000),
        _ => None,
    };
    millis.map(Duration::from_millis).ok_or_else(invalid)
}

fn parse_version(text: &str) -> Result<(u64, u64, u64), ConfigError> {
    let invalid = || ConfigError::InvalidVersion(text.to_string());
    let mut parts = text.trim().split('.');
    let mut next = || -> Result<u64, ConfigError> {
        match parts.next() {
            Some(p) => p.parse().map_err(|_| invalid()),
            None => Ok(0),
        }
    };
    let version = (next()?, next()?, next()?);
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(version)
}
