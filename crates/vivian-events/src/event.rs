//! Event definitions: the record broadcast to subscribers.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Something that happened, broadcast to interested subscribers.
///
/// Serializes to the persistent log line format:
/// `{"type", "data", "context", "source", "tags", "timestamp"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Epoch seconds.
    pub timestamp: f64,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            context: Map::new(),
            source: None,
            tags: BTreeSet::new(),
            timestamp: vivian_core::util::epoch_secs(),
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }

    pub fn with_tags(mut self, tags: BTreeSet<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// One line of the persistent JSONL log.
    pub fn to_log_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Event type={} source={} tags={:?} timestamp={}>",
            self.event_type,
            self.source.as_deref().unwrap_or("None"),
            self.tags,
            self.timestamp
        )
    }
}

/// Options accepted by [`crate::EventBus::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub context: Map<String, Value>,
    /// Run each handler on its own thread instead of inline.
    pub asynchronous: bool,
    pub source: Option<String>,
    pub tags: BTreeSet<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Insert a single context entry.
    pub fn context_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub(crate) fn into_event(self, event_type: &str, data: Value) -> Event {
        Event::new(event_type, data)
            .with_context(self.context)
            .with_source(self.source)
            .with_tags(self.tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_line_format() {
        let event = Event::new("memory_updated", json!({"key": "mood"}))
            .with_source(Some("memory".into()))
            .with_tags(["user".to_string(), "audit".to_string()].into_iter().collect())
            .with_timestamp(1700000000.5);

        let line: Value = serde_json::from_str(&event.to_log_line().unwrap()).unwrap();
        assert_eq!(line["type"], "memory_updated");
        assert_eq!(line["data"]["key"], "mood");
        assert_eq!(line["context"], json!({}));
        assert_eq!(line["source"], "memory");
        assert_eq!(line["tags"], json!(["audit", "user"]));
        assert_eq!(line["timestamp"], 1700000000.5);
    }

    #[test]
    fn test_log_line_null_source() {
        let event = Event::new("tick", Value::Null);
        let line: Value = serde_json::from_str(&event.to_log_line().unwrap()).unwrap();
        assert!(line["source"].is_null());
        assert_eq!(line["tags"], json!([]));
    }

    #[test]
    fn test_publish_options_build_event() {
        let event = PublishOptions::new()
            .context_entry("user", json!("ana"))
            .source("plugins")
            .tag("echo")
            .into_event("plugin_loaded", json!(1));
        assert_eq!(event.event_type, "plugin_loaded");
        assert_eq!(event.context["user"], "ana");
        assert_eq!(event.source.as_deref(), Some("plugins"));
        assert!(event.has_tag("echo"));
    }

    #[test]
    fn test_display() {
        let event = Event::new("x", Value::Null).with_timestamp(1.0);
        assert_eq!(event.to_string(), "<Event type=x source=None tags={} timestamp=1>");
    }
}
