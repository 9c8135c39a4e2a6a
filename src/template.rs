//! Template substitution
//!
//! Templates are configuration values whose strings may carry placeholders:
//!
//! - `$name` and `${name}` insert a context value
//! - `$$` is a literal `$`
//! - `${name|helper|helper}` pipes the value through helpers
//!
//! Rendering is either permissive (unresolvable placeholders stay verbatim) or
//! strict (they are an error). A string that is exactly one placeholder keeps
//! the native value instead of being stringified.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Deserialize;
use thiserror::Error;

use crate::context::{Context, Value};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:(?P<escaped>\$)|(?P<named>[_A-Za-z][_A-Za-z0-9]*)|\{(?P<braced>[^{}]*)\})")
        .unwrap_or_else(|e| unreachable!("placeholder pattern: {e}"))
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[_A-Za-z][_A-Za-z0-9]*$").unwrap_or_else(|e| unreachable!("identifier pattern: {e}"))
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unresolved placeholder '{0}'")]
    UnresolvedPlaceholder(String),

    #[error("Unknown template helper '{0}'")]
    UnknownHelper(String),

    #[error("Helper '{helper}' cannot be applied to '{value}'")]
    HelperFailed { helper: String, value: String },

    #[error("Malformed placeholder '{0}'")]
    Malformed(String),
}

/// How unresolvable placeholders are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Keep the placeholder text
    Permissive,
    /// Fail with [`TemplateError::UnresolvedPlaceholder`]
    Strict,
}

/// A configuration value that may contain placeholders
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Template {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<Template>),
    Map(BTreeMap<String, Template>),
}

impl Template {
    pub fn text(s: impl Into<String>) -> Self {
        Template::Text(s.into())
    }

    pub fn render(&self, ctx: &Context, mode: Mode) -> Result<Value, TemplateError> {
        Ok(match self {
            Template::Bool(b) => Value::Bool(*b),
            Template::Integer(i) => Value::Int64(*i),
            Template::Float(f) => Value::Double(*f),
            Template::Text(s) => render_text(s, ctx, mode)?,
            Template::List(items) => Value::List(
                items
                    .iter()
                    .map(|t| t.render(ctx, mode))
                    .collect::<Result<_, _>>()?,
            ),
            Template::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, t)| Ok((k.clone(), t.render(ctx, mode)?)))
                    .collect::<Result<_, TemplateError>>()?,
            ),
        })
    }

    pub fn render_strict(&self, ctx: &Context) -> Result<Value, TemplateError> {
        self.render(ctx, Mode::Strict)
    }

    /// Permissive rendering never fails; anything unresolvable stays as written.
    pub fn render_permissive(&self, ctx: &Context) -> Value {
        match self.render(ctx, Mode::Permissive) {
            Ok(value) => value,
            Err(_) => self.literal(),
        }
    }

    /// The template as a value, without substitution
    pub fn literal(&self) -> Value {
        match self {
            Template::Bool(b) => Value::Bool(*b),
            Template::Integer(i) => Value::Int64(*i),
            Template::Float(f) => Value::Double(*f),
            Template::Text(s) => Value::Str(s.clone()),
            Template::List(items) => Value::List(items.iter().map(Template::literal).collect()),
            Template::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, t)| (k.clone(), t.literal()))
                    .collect(),
            ),
        }
    }

    /// Context keys referenced by placeholders
    pub fn placeholders(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.collect_placeholders(&mut keys);
        keys
    }

    fn collect_placeholders(&self, keys: &mut Vec<String>) {
        match self {
            Template::Text(s) => {
                for caps in PLACEHOLDER.captures_iter(s) {
                    let key = match (caps.name("named"), caps.name("braced")) {
                        (Some(named), _) => named.as_str().to_string(),
                        (None, Some(braced)) => Placeholder::parse(braced.as_str()).key,
                        _ => continue,
                    };
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
            Template::List(items) => items.iter().for_each(|t| t.collect_placeholders(keys)),
            Template::Map(map) => map.values().for_each(|t| t.collect_placeholders(keys)),
            _ => {}
        }
    }
}

impl From<&str> for Template {
    fn from(s: &str) -> Self {
        Template::Text(s.to_string())
    }
}

struct Placeholder {
    key: String,
    helpers: Vec<String>,
}

impl Placeholder {
    fn parse(body: &str) -> Self {
        let mut parts = body.split('|').map(str::trim);
        let key = parts.next().unwrap_or_default().to_string();
        Self {
            key,
            helpers: parts.map(str::to_string).collect(),
        }
    }

    fn resolve(&self, ctx: &Context) -> Result<Value, TemplateError> {
        let value = ctx
            .lookup(&self.key)
            .ok_or_else(|| TemplateError::UnresolvedPlaceholder(self.key.clone()))?;
        self.helpers
            .iter()
            .try_fold(value, |value, helper| apply_helper(helper, value))
    }
}

/// Resolve one regex match. `Ok(None)` means "leave the text as written".
fn substitute(caps: &Captures<'_>, ctx: &Context, mode: Mode) -> Result<Option<Value>, TemplateError> {
    if caps.name("escaped").is_some() {
        return Ok(Some(Value::Str("$".to_string())));
    }
    let placeholder = if let Some(named) = caps.name("named") {
        Placeholder {
            key: named.as_str().to_string(),
            helpers: Vec::new(),
        }
    } else if let Some(braced) = caps.name("braced") {
        let placeholder = Placeholder::parse(braced.as_str());
        if !IDENTIFIER.is_match(&placeholder.key) {
            return match mode {
                Mode::Strict => Err(TemplateError::Malformed(braced.as_str().to_string())),
                Mode::Permissive => Ok(None),
            };
        }
        placeholder
    } else {
        return Ok(None);
    };

    match (placeholder.resolve(ctx), mode) {
        (Ok(value), _) => Ok(Some(value)),
        (Err(_), Mode::Permissive) => Ok(None),
        (Err(e), Mode::Strict) => Err(e),
    }
}

fn render_text(text: &str, ctx: &Context, mode: Mode) -> Result<Value, TemplateError> {
    // A lone placeholder keeps its native type.
    if let Some(caps) = PLACEHOLDER.captures(text) {
        let whole = caps.get(0).map(|m| m.range()) == Some(0..text.len());
        if whole && caps.name("escaped").is_none() {
            return Ok(substitute(&caps, ctx, mode)?.unwrap_or_else(|| Value::Str(text.to_string())));
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&text[last..m.start()]);
        match substitute(&caps, ctx, mode)? {
            Some(value) => out.push_str(&value.to_string()),
            None => out.push_str(m.as_str()),
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    Ok(Value::Str(out))
}

fn apply_helper(helper: &str, value: Value) -> Result<Value, TemplateError> {
    let failed = |value: &Value| TemplateError::HelperFailed {
        helper: helper.to_string(),
        value: value.to_string(),
    };
    Ok(match helper {
        "lower" => Value::Str(value.to_string().to_lowercase()),
        "upper" => Value::Str(value.to_string().to_uppercase()),
        "trim" => Value::Str(value.to_string().trim().to_string()),
        "str" => Value::Str(value.to_string()),
        "basename" => {
            let text = value.as_str().ok_or_else(|| failed(&value))?;
            let trimmed = text.trim_end_matches('/');
            Value::Str(trimmed.rsplit('/').next().unwrap_or_default().to_string())
        }
        "dirname" => {
            let text = value.as_str().ok_or_else(|| failed(&value))?;
            let dir = match text.trim_end_matches('/').rsplit_once('/') {
                Some(("", _)) => "/",
                Some((dir, _)) => dir,
                None => ".",
            };
            Value::Str(dir.to_string())
        }
        "len" => {
            let len = match &value {
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                Value::Str(s) | Value::ObjectPath(s) => s.chars().count(),
                other => return Err(failed(other)),
            };
            Value::Int64(len as i64)
        }
        "int" => match &value {
            Value::Double(f) if f.is_finite() => Value::Int64(f.trunc() as i64),
            Value::Bool(b) => Value::Int64(i64::from(*b)),
            other => other
                .as_i128()
                .and_then(|i| i64::try_from(i).ok())
                .map(Value::Int64)
                .ok_or_else(|| failed(other))?,
        },
        _ => return Err(TemplateError::UnknownHelper(helper.to_string())),
    })
}
