//! Hierarchical parameter contexts
//!
//! A [`Context`] holds local bindings and reads through to an optional parent.
//! The parent link is weak: a context never keeps its parent alive. Once a
//! context is shared behind an `Arc` it is immutable, so children can only
//! shadow parent bindings, never change them.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use thiserror::Error;

pub use rgbhook_bus::Value;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),
}

/// Key/value scope with fallback to a parent scope
#[derive(Debug, Default)]
pub struct Context {
    bindings: BTreeMap<String, Value>,
    parent: Option<Weak<Context>>,
}

impl Context {
    /// Empty root context
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty context reading through to `parent`
    pub fn child(parent: &Arc<Context>) -> Self {
        Self {
            bindings: BTreeMap::new(),
            parent: Some(Arc::downgrade(parent)),
        }
    }

    /// Builder-style binding
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(key.into(), value.into());
        self
    }

    /// Bind a key in this layer only
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.bindings.insert(key.into(), value.into());
    }

    pub fn parent(&self) -> Option<Arc<Context>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Resolve a key here, then in each ancestor in turn
    pub fn get(&self, key: &str) -> Result<Value, ContextError> {
        self.lookup(key)
            .ok_or_else(|| ContextError::KeyNotFound(key.to_string()))
    }

    pub fn lookup(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.bindings.get(key) {
            return Some(value.clone());
        }
        let mut next = self.parent();
        while let Some(ctx) = next {
            if let Some(value) = ctx.bindings.get(key) {
                return Some(value.clone());
            }
            next = ctx.parent();
        }
        None
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Keys bound in this layer
    pub fn local_keys(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Every visible binding, nearer layers shadowing farther ones
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut layers = vec![self.bindings.clone()];
        let mut next = self.parent();
        while let Some(ctx) = next {
            layers.push(ctx.bindings.clone());
            next = ctx.parent();
        }
        let mut merged = BTreeMap::new();
        for layer in layers.into_iter().rev() {
            merged.extend(layer);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_binding_resolves() {
        let root = Arc::new(Context::new().with("debug", false).with("user", "ana"));
        let hook = Arc::new(Context::child(&root).with("hook", "music"));
        let event = Context::child(&hook).with("sig_arg0", "spotify");

        assert_eq!(event.get("user").unwrap(), Value::from("ana"));
        assert_eq!(event.get("hook").unwrap(), Value::from("music"));
        assert_eq!(event.get("sig_arg0").unwrap(), Value::from("spotify"));
    }

    #[test]
    fn missing_key_is_an_error() {
        let root = Arc::new(Context::new());
        let child = Context::child(&root);
        assert_eq!(
            child.get("nope"),
            Err(ContextError::KeyNotFound("nope".into()))
        );
    }

    #[test]
    fn child_shadows_without_touching_parent() {
        let root = Arc::new(Context::new().with("color", "red"));
        let mut child = Context::child(&root);
        child.insert("color", "blue");

        assert_eq!(child.get("color").unwrap(), Value::from("blue"));
        assert_eq!(root.get("color").unwrap(), Value::from("red"));
        assert_eq!(child.flatten()["color"], Value::from("blue"));
    }

    #[test]
    fn parent_link_is_weak() {
        let root = Arc::new(Context::new().with("debug", true));
        let child = Context::child(&root);
        drop(root);

        assert!(child.parent().is_none());
        assert!(!child.contains("debug"));
    }
}
