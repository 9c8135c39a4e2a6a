//! Trigger conditions
//!
//! A condition renders a method call from the event context, issues it, and
//! compares the reply with an expected value.

use std::time::Duration;

use rgbhook_bus::{Bus, BusError, MethodCall, Value};
use thiserror::Error;
use tracing::debug;

use crate::context::Context;
use crate::template::{Template, TemplateError};

/// Default bound on one remote query
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ConditionError {
    #[error("Condition template: {0}")]
    Template(#[from] TemplateError),

    #[error("Remote query failed: {0}")]
    RemoteQueryFailed(#[source] BusError),

    #[error("Signature '{signature}' has {expected} type codes but {actual} arguments were given")]
    SignatureMismatch {
        signature: String,
        expected: usize,
        actual: usize,
    },

    #[error("Argument {index}: {source}")]
    InvalidArgument {
        index: usize,
        #[source]
        source: BusError,
    },
}

/// Remote-query predicate
#[derive(Debug, Clone)]
pub struct Condition {
    pub service: Template,
    pub path: Template,
    pub interface: Option<Template>,
    pub method: Template,
    pub response: Template,
    pub arguments: Vec<Template>,
    /// One D-Bus basic type code per argument
    pub signature: Option<String>,
    pub timeout: Duration,
}

impl Condition {
    pub fn new(service: Template, path: Template, method: Template, response: Template) -> Self {
        Self {
            service,
            path,
            interface: None,
            method,
            response,
            arguments: Vec::new(),
            signature: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Render the outbound call in strict mode
    pub fn render_call(&self, ctx: &Context) -> Result<MethodCall, ConditionError> {
        let text = |t: &Template| t.render_strict(ctx).map(|v| v.to_string());

        let mut args = self
            .arguments
            .iter()
            .map(|t| t.render_strict(ctx))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(signature) = &self.signature {
            let codes: Vec<char> = signature.chars().collect();
            if codes.len() != args.len() {
                return Err(ConditionError::SignatureMismatch {
                    signature: signature.clone(),
                    expected: codes.len(),
                    actual: args.len(),
                });
            }
            args = args
                .iter()
                .zip(codes)
                .enumerate()
                .map(|(index, (arg, code))| {
                    arg.coerce(code)
                        .map_err(|source| ConditionError::InvalidArgument { index, source })
                })
                .collect::<Result<_, _>>()?;
        }

        Ok(MethodCall {
            service: text(&self.service)?,
            path: text(&self.path)?,
            interface: self.interface.as_ref().map(text).transpose()?,
            method: text(&self.method)?,
            args,
        })
    }

    /// Issue the query and compare its reply with the expected response
    pub async fn evaluate(&self, bus: &dyn Bus, ctx: &Context) -> Result<bool, ConditionError> {
        let call = self.render_call(ctx)?;
        let expected = self.response.render_strict(ctx)?;

        let reply = tokio::time::timeout(self.timeout, bus.call(&call))
            .await
            .map_err(|_| ConditionError::RemoteQueryFailed(BusError::Timeout(self.timeout)))?
            .map_err(ConditionError::RemoteQueryFailed)?;

        let holds = reply.value_eq(&expected);
        debug!(%call, %reply, %expected, holds, "Evaluated condition");
        Ok(holds)
    }
}

/// The expected response, for display
pub fn describe(condition: &Condition) -> String {
    format!(
        "{} {} {} == {}",
        condition.service.literal(),
        condition.path.literal(),
        condition.method.literal(),
        match condition.response.literal() {
            Value::Str(s) => format!("'{s}'"),
            other => other.to_string(),
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rgbhook_bus::{BusScope, MemoryBus};

    const SERVICE: &str = "org.mpris.MediaPlayer2.spotify";
    const PATH: &str = "/org/mpris/MediaPlayer2";

    fn playback_condition() -> Condition {
        let mut c = Condition::new(
            SERVICE.into(),
            PATH.into(),
            "Get".into(),
            "$expected".into(),
        );
        c.interface = Some("org.freedesktop.DBus.Properties".into());
        c.arguments = vec!["org.mpris.MediaPlayer2.Player".into(), "${property}".into()];
        c
    }

    fn ctx() -> Context {
        Context::new()
            .with("expected", "Playing")
            .with("property", "PlaybackStatus")
    }

    #[tokio::test]
    async fn holds_when_reply_matches() {
        let bus = MemoryBus::new(BusScope::Session);
        bus.reply(SERVICE, PATH, "Get", Value::from("Playing"));

        assert!(playback_condition().evaluate(&bus, &ctx()).await.unwrap());
        let call = &bus.calls()[0];
        assert_eq!(call.interface.as_deref(), Some("org.freedesktop.DBus.Properties"));
        assert_eq!(call.args[1], Value::from("PlaybackStatus"));
    }

    #[tokio::test]
    async fn fails_when_reply_differs() {
        let bus = MemoryBus::new(BusScope::Session);
        bus.reply(SERVICE, PATH, "Get", Value::from("Paused"));
        assert!(!playback_condition().evaluate(&bus, &ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn unresolved_placeholder_never_reaches_the_bus() {
        let bus = MemoryBus::new(BusScope::Session);
        let err = playback_condition()
            .evaluate(&bus, &Context::new().with("expected", "Playing"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConditionError::Template(TemplateError::UnresolvedPlaceholder(key)) if key == "property"
        ));
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn remote_failure_is_reported() {
        let bus = MemoryBus::new(BusScope::Session);
        bus.fail(SERVICE, PATH, "Get", "org.freedesktop.DBus.Error.UnknownProperty");
        assert!(matches!(
            playback_condition().evaluate(&bus, &ctx()).await,
            Err(ConditionError::RemoteQueryFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reply_times_out() {
        let bus = MemoryBus::new(BusScope::Session);
        bus.reply_after(SERVICE, PATH, "Get", Value::from("Playing"), Duration::from_secs(10));
        let mut condition = playback_condition();
        condition.timeout = Duration::from_millis(200);

        assert!(matches!(
            condition.evaluate(&bus, &ctx()).await,
            Err(ConditionError::RemoteQueryFailed(BusError::Timeout(_)))
        ));
    }

    #[test]
    fn signature_coerces_arguments() {
        let mut condition = Condition::new(
            "org.example".into(),
            "/org/example".into(),
            "GetVolume".into(),
            Template::Integer(50),
        );
        condition.arguments = vec!["$index".into(), Template::Bool(true)];
        condition.signature = Some("ub".into());

        let call = condition
            .render_call(&Context::new().with("index", "3"))
            .unwrap();
        assert_eq!(call.args, vec![Value::UInt32(3), Value::Bool(true)]);

        condition.signature = Some("u".into());
        assert!(matches!(
            condition.render_call(&Context::new().with("index", "3")),
            Err(ConditionError::SignatureMismatch { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn describe_quotes_strings() {
        assert_eq!(
            describe(&playback_condition()),
            format!("{SERVICE} {PATH} Get == '$expected'")
        );
    }
}
