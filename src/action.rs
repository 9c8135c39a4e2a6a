//! Actions: chain-composable producers of state overlays
//!
//! Every node of an [`Action`] chain contributes a partial device state. On
//! [`Action::act`] the fragments are merged and pushed onto the shared stack
//! as one overlay; [`Action::reset`] removes exactly that overlay again.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use openrgb_client::{DeviceId, Rgb};
use thiserror::Error;
use tracing::debug;

use crate::context::{Context, Value};
use crate::effect::{EffectDef, EffectError, ResolvedEffect};
use crate::stack::{
    Cookie, DeviceLayout, IncompatibleStateMerge, Layouts, Overlay, Paint, SharedStack, StackError,
};
use crate::template::{Template, TemplateError};

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Action template: {0}")]
    Template(#[from] TemplateError),

    #[error("Invalid color '{0}'")]
    InvalidColor(String),

    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("Device {device} has no zone '{zone}'")]
    UnknownZone { device: DeviceId, zone: String },

    #[error(transparent)]
    Effect(#[from] EffectError),

    #[error(transparent)]
    Merge(#[from] IncompatibleStateMerge),

    #[error(transparent)]
    Stack(#[from] StackError),
}

/// Computes one node's partial state from the event context
pub trait ConstructState {
    fn construct_state(&self, ctx: &Context, layouts: &Layouts) -> Result<Overlay, ActionError>;
}

/// Explicit element indices, one color
#[derive(Debug, Clone)]
pub struct LedsAction {
    pub device: DeviceId,
    pub leds: Vec<usize>,
    pub color: Template,
}

/// A named zone, one color
#[derive(Debug, Clone)]
pub struct ZoneAction {
    pub device: DeviceId,
    pub zone: String,
    pub color: Template,
}

/// Every element of a device
#[derive(Debug, Clone)]
pub struct FillAction {
    pub device: DeviceId,
    pub color: Template,
}

/// Elements an effect runs on
#[derive(Debug, Clone)]
pub enum EffectTarget {
    Leds(Vec<usize>),
    Zone(String),
    All,
}

/// Keyframe effect from the library
#[derive(Debug, Clone)]
pub struct EffectAction {
    pub device: DeviceId,
    pub target: EffectTarget,
    pub name: String,
    pub effect: Arc<EffectDef>,
    /// Effect variables; each renders to a color
    pub vars: BTreeMap<String, Template>,
}

#[derive(Debug, Clone)]
pub enum ActionKind {
    Leds(LedsAction),
    Zone(ZoneAction),
    Fill(FillAction),
    Effect(EffectAction),
}

impl ActionKind {
    pub fn device(&self) -> DeviceId {
        match self {
            ActionKind::Leds(a) => a.device,
            ActionKind::Zone(a) => a.device,
            ActionKind::Fill(a) => a.device,
            ActionKind::Effect(a) => a.device,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ActionKind::Leds(a) => format!("leds {:?} on device {}", a.leds, a.device),
            ActionKind::Zone(a) => format!("zone '{}' on device {}", a.zone, a.device),
            ActionKind::Fill(a) => format!("fill device {}", a.device),
            ActionKind::Effect(a) => format!("effect '{}' on device {}", a.name, a.device),
        }
    }
}

impl ConstructState for ActionKind {
    fn construct_state(&self, ctx: &Context, layouts: &Layouts) -> Result<Overlay, ActionError> {
        match self {
            ActionKind::Leds(a) => a.construct_state(ctx, layouts),
            ActionKind::Zone(a) => a.construct_state(ctx, layouts),
            ActionKind::Fill(a) => a.construct_state(ctx, layouts),
            ActionKind::Effect(a) => a.construct_state(ctx, layouts),
        }
    }
}

impl ConstructState for LedsAction {
    fn construct_state(&self, ctx: &Context, _layouts: &Layouts) -> Result<Overlay, ActionError> {
        let color = render_color(&self.color, ctx)?;
        let mut overlay = Overlay::new();
        overlay.set_all(self.device, self.leds.iter().copied(), Paint::Solid(color));
        Ok(overlay)
    }
}

impl ConstructState for ZoneAction {
    fn construct_state(&self, ctx: &Context, layouts: &Layouts) -> Result<Overlay, ActionError> {
        let range = zone_range(layout(layouts, self.device)?, &self.zone)?;
        let color = render_color(&self.color, ctx)?;
        let mut overlay = Overlay::new();
        overlay.set_all(self.device, range, Paint::Solid(color));
        Ok(overlay)
    }
}

impl ConstructState for FillAction {
    fn construct_state(&self, ctx: &Context, layouts: &Layouts) -> Result<Overlay, ActionError> {
        let count = layout(layouts, self.device)?.element_count;
        let color = render_color(&self.color, ctx)?;
        let mut overlay = Overlay::new();
        overlay.set_all(self.device, 0..count, Paint::Solid(color));
        Ok(overlay)
    }
}

impl ConstructState for EffectAction {
    fn construct_state(&self, ctx: &Context, layouts: &Layouts) -> Result<Overlay, ActionError> {
        let layout = layout(layouts, self.device)?;
        let indices: Vec<usize> = match &self.target {
            EffectTarget::Leds(leds) => leds.clone(),
            EffectTarget::Zone(zone) => zone_range(layout, zone)?.collect(),
            EffectTarget::All => (0..layout.element_count).collect(),
        };

        let vars = self
            .vars
            .iter()
            .map(|(name, t)| Ok((name.clone(), render_color(t, ctx)?)))
            .collect::<Result<BTreeMap<_, _>, ActionError>>()?;
        let resolved = ResolvedEffect::resolve(&self.effect, &vars)?;

        let mut overlay = Overlay::new();
        overlay.set_all(self.device, indices, Paint::Animated(Arc::new(resolved)));
        Ok(overlay)
    }
}

fn layout(layouts: &Layouts, device: DeviceId) -> Result<&DeviceLayout, ActionError> {
    layouts.device(device).ok_or(ActionError::UnknownDevice(device))
}

fn zone_range(layout: &DeviceLayout, zone: &str) -> Result<Range<usize>, ActionError> {
    layout.zone(zone).ok_or_else(|| ActionError::UnknownZone {
        device: layout.id,
        zone: zone.to_string(),
    })
}

/// Render a color template: `[r, g, b]` or anything [`Rgb::parse`] accepts
pub fn render_color(template: &Template, ctx: &Context) -> Result<Rgb, ActionError> {
    let value = template.render_strict(ctx)?;
    color_from_value(&value).ok_or_else(|| ActionError::InvalidColor(value.to_string()))
}

fn color_from_value(value: &Value) -> Option<Rgb> {
    match value {
        Value::List(items) if items.len() == 3 => {
            let mut channels = [0u8; 3];
            for (slot, item) in channels.iter_mut().zip(items) {
                *slot = u8::try_from(item.as_i128()?).ok()?;
            }
            Some(Rgb::from(channels))
        }
        other => Rgb::parse(other.as_str()?.trim()),
    }
}

/// Chain of action nodes ending in a no-op
#[derive(Debug, Clone, Default)]
pub enum Action {
    #[default]
    Noop,
    Wrap {
        kind: ActionKind,
        inner: Box<Action>,
    },
}

impl Action {
    /// Build a chain; earlier kinds sit further in and win same-kind conflicts
    pub fn chain(kinds: impl IntoIterator<Item = ActionKind>) -> Self {
        kinds.into_iter().fold(Action::Noop, |inner, kind| Action::Wrap {
            kind,
            inner: Box::new(inner),
        })
    }

    /// Number of non-terminal nodes
    pub fn len(&self) -> usize {
        match self {
            Action::Noop => 0,
            Action::Wrap { inner, .. } => 1 + inner.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Action::Noop)
    }

    /// Nodes from the innermost outwards, i.e. in declaration order
    pub fn kinds(&self) -> Vec<&ActionKind> {
        let mut kinds = Vec::new();
        let mut node = self;
        while let Action::Wrap { kind, inner } = node {
            kinds.push(kind);
            node = inner;
        }
        kinds.reverse();
        kinds
    }

    /// Merge this node's fragment with everything inside it
    pub fn merged_state(&self, ctx: &Context, layouts: &Layouts) -> Result<Overlay, ActionError> {
        match self {
            Action::Noop => Ok(Overlay::new()),
            Action::Wrap { kind, inner } => {
                let inner = inner.merged_state(ctx, layouts)?;
                Ok(kind.construct_state(ctx, layouts)?.merge(inner)?)
            }
        }
    }

    /// Push the merged state; the cookie removes it again
    pub async fn act(&self, ctx: &Context, stack: &SharedStack) -> Result<Cookie, ActionError> {
        let overlay = self.merged_state(ctx, stack.layouts())?;
        let animated = overlay.is_animated();
        let cookie = stack.push(overlay).await?;
        debug!(%cookie, animated, "Applied action state");
        Ok(cookie)
    }

    pub async fn reset(&self, cookie: Cookie, stack: &SharedStack) -> Result<(), ActionError> {
        stack.remove(cookie).await?;
        debug!(%cookie, "Reset action state");
        Ok(())
    }
}

impl ConstructState for Action {
    fn construct_state(&self, ctx: &Context, layouts: &Layouts) -> Result<Overlay, ActionError> {
        self.merged_state(ctx, layouts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectLibrary;
    use openrgb_client::{MemoryClient, Zone};
    use std::time::Duration;

    const RED: Rgb = Rgb::new(255, 0, 0);
    const BLUE: Rgb = Rgb::new(0, 0, 255);

    async fn stack() -> (Arc<MemoryClient>, SharedStack) {
        let client = Arc::new(MemoryClient::default().with_device(
            "Keyboard",
            6,
            Rgb::BLACK,
            vec![Zone::new("Main", 0, 4), Zone::new("Logo", 4, 2)],
        ));
        let stack = SharedStack::load(client.clone()).await.unwrap();
        (client, stack)
    }

    fn leds(leds: Vec<usize>, color: Template) -> ActionKind {
        ActionKind::Leds(LedsAction {
            device: 0,
            leds,
            color,
        })
    }

    fn rgb(r: i64, g: i64, b: i64) -> Template {
        Template::List(vec![Template::Integer(r), Template::Integer(g), Template::Integer(b)])
    }

    #[test]
    fn colors_from_lists_and_names() {
        let ctx = Context::new().with("status", "#00ff00");
        assert_eq!(render_color(&rgb(255, 0, 0), &ctx).unwrap(), RED);
        assert_eq!(render_color(&"blue".into(), &ctx).unwrap(), BLUE);
        assert_eq!(render_color(&"$status".into(), &ctx).unwrap(), Rgb::new(0, 255, 0));
        assert!(matches!(
            render_color(&rgb(256, 0, 0), &ctx),
            Err(ActionError::InvalidColor(_))
        ));
        assert!(matches!(
            render_color(&"$missing".into(), &ctx),
            Err(ActionError::Template(TemplateError::UnresolvedPlaceholder(_)))
        ));
    }

    #[test]
    fn chain_keeps_declaration_order() {
        let action = Action::chain([leds(vec![0], "red".into()), leds(vec![1], "blue".into())]);
        assert_eq!(action.len(), 2);
        let kinds = action.kinds();
        assert!(matches!(kinds[0], ActionKind::Leds(a) if a.leds == vec![0]));
        assert!(Action::chain([]).is_empty());
    }

    #[tokio::test]
    async fn inner_node_wins_same_kind_conflict() {
        let (_client, stack) = stack().await;
        let action = Action::chain([leds(vec![0, 1], "red".into()), leds(vec![1, 2], "blue".into())]);
        let overlay = action.merged_state(&Context::new(), stack.layouts()).unwrap();
        let color = |i| overlay.get(0, i).unwrap().color_at(Duration::ZERO);
        assert_eq!(color(0), RED);
        assert_eq!(color(1), RED);
        assert_eq!(color(2), BLUE);
    }

    #[tokio::test]
    async fn static_and_animated_on_one_element_conflict() {
        let (_client, stack) = stack().await;
        let lib = EffectLibrary::builtin();
        let effect = ActionKind::Effect(EffectAction {
            device: 0,
            target: EffectTarget::Zone("Logo".into()),
            name: "police".into(),
            effect: Arc::new(lib.get("police").unwrap().clone()),
            vars: BTreeMap::new(),
        });
        let action = Action::chain([leds(vec![5], "red".into()), effect]);
        assert!(matches!(
            action.merged_state(&Context::new(), stack.layouts()),
            Err(ActionError::Merge(IncompatibleStateMerge { device: 0, index: 5, .. }))
        ));
    }

    #[tokio::test]
    async fn zone_and_fill_resolve_layouts() {
        let (client, stack) = stack().await;
        let zone = Action::chain([ActionKind::Zone(ZoneAction {
            device: 0,
            zone: "logo".into(),
            color: "blue".into(),
        })]);
        let cookie = zone.act(&Context::new(), &stack).await.unwrap();
        assert_eq!(
            client.colors(0).unwrap(),
            vec![Rgb::BLACK, Rgb::BLACK, Rgb::BLACK, Rgb::BLACK, BLUE, BLUE]
        );

        let fill = Action::chain([ActionKind::Fill(FillAction {
            device: 0,
            color: rgb(255, 0, 0),
        })]);
        let fill_cookie = fill.act(&Context::new(), &stack).await.unwrap();
        assert_eq!(client.colors(0).unwrap(), vec![RED; 6]);

        fill.reset(fill_cookie, &stack).await.unwrap();
        zone.reset(cookie, &stack).await.unwrap();
        assert_eq!(client.colors(0).unwrap(), vec![Rgb::BLACK; 6]);
    }

    #[tokio::test]
    async fn unknown_targets_fail_before_pushing() {
        let (_client, stack) = stack().await;
        let zone = Action::chain([ActionKind::Zone(ZoneAction {
            device: 0,
            zone: "Underglow".into(),
            color: "red".into(),
        })]);
        assert!(matches!(
            zone.act(&Context::new(), &stack).await,
            Err(ActionError::UnknownZone { device: 0, .. })
        ));

        let fill = Action::chain([ActionKind::Fill(FillAction {
            device: 4,
            color: "red".into(),
        })]);
        assert!(matches!(
            fill.act(&Context::new(), &stack).await,
            Err(ActionError::UnknownDevice(4))
        ));

        let out_of_range = Action::chain([leds(vec![6], "red".into())]);
        assert!(matches!(
            out_of_range.act(&Context::new(), &stack).await,
            Err(ActionError::Stack(StackError::ElementOutOfRange { index: 6, .. }))
        ));
        assert!(stack.is_empty().await);
    }

    #[tokio::test]
    async fn effect_variables_come_from_context() {
        let (_client, stack) = stack().await;
        let lib = EffectLibrary::builtin();
        let action = Action::chain([ActionKind::Effect(EffectAction {
            device: 0,
            target: EffectTarget::Leds(vec![0]),
            name: "solid".into(),
            effect: Arc::new(lib.get("solid").unwrap().clone()),
            vars: BTreeMap::from([("color".to_string(), Template::from("$sig_arg0"))]),
        })]);
        let ctx = Context::new().with("sig_arg0", "purple");
        let cookie = action.act(&ctx, &stack).await.unwrap();
        assert!(stack.is_animated().await);
        assert_eq!(stack.resolve(0).await.unwrap()[0], Rgb::new(128, 0, 255));
        action.reset(cookie, &stack).await.unwrap();
        assert!(!stack.is_animated().await);
    }
}
