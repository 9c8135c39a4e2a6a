//! Signal match filters and raw signal events

use std::fmt::Write as _;

use crate::value::Value;

/// A signal as it arrived from the bus, before any hook-level filtering
#[derive(Debug, Clone, PartialEq)]
pub struct RawSignal {
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub destination: Option<String>,
    pub args: Vec<Value>,
}

impl RawSignal {
    pub fn new(
        sender: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            destination: None,
            args: Vec::new(),
        }
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// Signal match parameters. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchFilter {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub destination: Option<String>,
    pub eavesdrop: bool,
}

fn is_unique_name(name: &str) -> bool {
    name.starts_with(':')
}

impl MatchFilter {
    /// Render the filter as a bus daemon match rule
    pub fn rule(&self) -> String {
        let mut rule = String::from("type='signal'");
        let fields = [
            ("sender", &self.sender),
            ("path", &self.path),
            ("interface", &self.interface),
            ("member", &self.member),
            ("destination", &self.destination),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                let _ = write!(rule, ",{key}='{}'", value.replace('\'', "\\'"));
            }
        }
        if self.eavesdrop {
            rule.push_str(",eavesdrop='true'");
        }
        rule
    }

    /// Well-known sender name whose owner must be tracked, if any
    pub fn well_known_sender(&self) -> Option<&str> {
        self.sender.as_deref().filter(|s| !is_unique_name(s))
    }

    /// Local re-check of a delivered signal.
    ///
    /// The bus daemon stamps signals with the sender's unique name, so a
    /// well-known `sender` also accepts `owner`, the unique name currently
    /// owning it. With no owner only an exact sender match passes. Unique
    /// senders ignore `owner`.
    pub fn matches(&self, signal: &RawSignal, owner: Option<&str>) -> bool {
        if let Some(sender) = &self.sender {
            let owned = !is_unique_name(sender) && owner == Some(signal.sender.as_str());
            let from_sender = *sender == signal.sender || owned;
            if !from_sender {
                return false;
            }
        }
        let field = |want: &Option<String>, got: &str| want.as_deref().map_or(true, |w| w == got);
        if !field(&self.path, &signal.path)
            || !field(&self.interface, &signal.interface)
            || !field(&self.member, &signal.member)
        {
            return false;
        }
        match &self.destination {
            Some(want) => signal.destination.as_deref() == Some(want.as_str()),
            None => true,
        }
    }
}
