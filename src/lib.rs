// rgbhook - declarative bus hooks driving OpenRGB lighting
// Contexts, templates, triggers, actions, the device state stack and the engine

pub mod action;
pub mod config;
pub mod context;
pub mod effect;
pub mod engine;
pub mod hook;
pub mod stack;
pub mod template;
pub mod trigger;

pub use action::{Action, ActionError, ActionKind};
pub use config::{Config, ConfigError};
pub use context::{Context, ContextError, Value};
pub use effect::{EffectError, EffectLibrary};
pub use engine::{Engine, EngineError};
pub use hook::{Hook, HookError, HookScope};
pub use stack::{Cookie, DeviceStateStack, Overlay, Paint, SharedStack, StackError};
pub use template::{Template, TemplateError};
pub use trigger::{Trigger, TriggerError, TriggerSource};
