//! Events and event descriptors.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Event I/O processor type used for sends between statechart sessions.
pub const SCXML_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";

/// Which queue an event was meant for, or whether the platform made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Generated by the engine (`done.*`, `error.*`).
    Platform,
    /// Raised by the chart itself.
    Internal,
    /// Delivered from outside the session.
    #[default]
    External,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Platform => "platform",
            EventKind::Internal => "internal",
            EventKind::External => "external",
        }
    }
}

/// An event flowing through a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    pub name: String,

    #[serde(default)]
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_type: Option<String>,

    /// Set when the event came from an invoked child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_id: Option<String>,

    #[serde(default)]
    pub data: Value,
}

impl Event {
    /// Creates an external event with no payload.
    pub fn external(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EventKind::External,
            ..Default::default()
        }
    }

    /// Creates an internal event, as produced by `raise`.
    pub fn internal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EventKind::Internal,
            ..Default::default()
        }
    }

    /// Creates a platform event.
    pub fn platform(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            kind: EventKind::Platform,
            data,
            ..Default::default()
        }
    }

    /// `error.execution` carrying a human readable reason.
    pub fn error_execution(reason: impl Into<String>) -> Self {
        Self::platform("error.execution", json!({ "reason": reason.into() }))
    }

    /// `error.communication`, tagged with the failing send id if any.
    pub fn error_communication(reason: impl Into<String>, send_id: Option<String>) -> Self {
        let mut event = Self::platform("error.communication", json!({ "reason": reason.into() }));
        event.send_id = send_id;
        event
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_send_id(mut self, send_id: impl Into<String>) -> Self {
        self.send_id = Some(send_id.into());
        self
    }

    pub fn with_invoke_id(mut self, invoke_id: impl Into<String>) -> Self {
        self.invoke_id = Some(invoke_id.into());
        self
    }

    /// Returns true for `error.*` events.
    pub fn is_error(&self) -> bool {
        self.name == "error" || self.name.starts_with("error.")
    }

    /// The `_event` value exposed to the evaluator.
    pub fn to_value(&self) -> Value {
        json!({
            "name": self.name,
            "type": self.kind.as_str(),
            "sendid": self.send_id,
            "origin": self.origin,
            "origintype": self.origin_type,
            "invokeid": self.invoke_id,
            "data": self.data,
        })
    }
}

/// One alternative of a transition's `event` attribute.
///
/// Matching is by dot-separated token prefix: `a.b` matches `a.b` and
/// `a.b.c`, but not `a.bc`. `*` matches every event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventDescriptor(String);

impl EventDescriptor {
    pub fn new(descriptor: &str) -> Self {
        let trimmed = descriptor.trim();
        let trimmed = trimmed.strip_suffix(".*").unwrap_or(trimmed);
        let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
        Self(trimmed.to_string())
    }

    /// Splits a space-separated attribute into descriptors.
    pub fn parse_list(attr: &str) -> Vec<EventDescriptor> {
        attr.split_whitespace().map(EventDescriptor::new).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.0 == "*" {
            return true;
        }
        match name.strip_prefix(self.0.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        }
    }
}

/// Returns true if any descriptor in the list matches `name`.
pub fn matches_any(descriptors: &[EventDescriptor], name: &str) -> bool {
    descriptors.iter().any(|d| d.matches(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_prefix_matching() {
        let d = EventDescriptor::new("foo.bar");
        assert!(d.matches("foo.bar"));
        assert!(d.matches("foo.bar.baz"));
        assert!(!d.matches("foo.barz"));
        assert!(!d.matches("foobar"));
        assert!(!d.matches("foo"));
    }

    #[test]
    fn test_wildcards() {
        assert!(EventDescriptor::new("*").matches("anything.at.all"));

        let d = EventDescriptor::new("error.*");
        assert_eq!(d.as_str(), "error");
        assert!(d.matches("error.execution"));
        assert!(!d.matches("errors"));

        let d = EventDescriptor::new("done.");
        assert!(d.matches("done.state.s1"));
    }

    #[test]
    fn test_alternatives() {
        let list = EventDescriptor::parse_list("  foo.barz  foo.bar ");
        assert_eq!(list.len(), 2);
        assert!(matches_any(&list, "foo.bar.baz"));
        assert!(!matches_any(&list, "foobar"));
        assert!(!matches_any(&[], "foo"));
    }

    #[test]
    fn test_event_value() {
        let event = Event::external("go")
            .with_data(json!({"n": 1}))
            .with_send_id("s1");
        let v = event.to_value();
        assert_eq!(v["name"], "go");
        assert_eq!(v["type"], "external");
        assert_eq!(v["sendid"], "s1");
        assert_eq!(v["data"]["n"], 1);
        assert!(v["invokeid"].is_null());
    }

    #[test]
    fn test_error_events() {
        let e = Event::error_execution("boom");
        assert!(e.is_error());
        assert_eq!(e.kind, EventKind::Platform);

        let e = Event::error_communication("down", Some("s1".into()));
        assert_eq!(e.name, "error.communication");
        assert_eq!(e.send_id.as_deref(), Some("s1"));
        assert!(!Event::external("errors").is_error());
    }

    proptest! {
        #[test]
        fn descriptor_matches_its_own_extensions(
            base in "[a-z]{1,6}(\\.[a-z]{1,6}){0,3}",
            suffix in "(\\.[a-z]{1,6}){0,3}",
        ) {
            let d = EventDescriptor::new(&base);
            let name = format!("{}{}", base, suffix);
            prop_assert!(d.matches(&name));
        }

        #[test]
        fn descriptor_rejects_glued_tokens(
            base in "[a-z]{1,6}(\\.[a-z]{1,6}){0,2}",
            glued in "[a-z]{1,4}",
        ) {
            let d = EventDescriptor::new(&base);
            let name = format!("{}{}", base, glued);
            prop_assert!(!d.matches(&name));
        }
    }
}
