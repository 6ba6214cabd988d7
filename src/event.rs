//! Events and the codecs that turn message payloads into them.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::StompSettings;

/// Tag added to the fallback event emitted when a payload cannot be decoded.
pub const DECODE_FAILURE_TAG: &str = "_stompdecodefailure";

/// Value of `@metadata.input` on every event.
pub const INPUT_NAME: &str = "stomp";

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a json object, got {0}")]
    NotAnObject(&'static str),
}

/// A decoded unit of data: an ordered JSON object.
///
/// Every event carries `@timestamp` (RFC 3339, UTC) and `@version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Map<String, Value>);

impl Event {
    pub fn new() -> Self {
        Self::from_map(Map::new())
    }

    /// An event whose `message` field holds `message`.
    pub fn with_message(message: impl Into<String>) -> Self {
        let mut event = Self::new();
        event.set("message", message.into());
        event
    }

    /// Wrap decoded fields, adding `@timestamp` and `@version` when missing.
    pub fn from_map(mut fields: Map<String, Value>) -> Self {
        if !fields.contains_key("@timestamp") {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            fields.insert("@timestamp".to_string(), Value::String(now));
        }
        fields
            .entry("@version")
            .or_insert_with(|| Value::String("1".to_string()));
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Tags in insertion order.
    pub fn tags(&self) -> Vec<&str> {
        match self.0.get("tags") {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(Value::String(s)) => vec![s.as_str()],
            _ => Vec::new(),
        }
    }

    /// Add `tag` unless already present.
    pub fn add_tag(&mut self, tag: &str) {
        let entry = self
            .0
            .entry("tags")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            let single = entry.take();
            *entry = Value::Array(vec![single]);
        }
        if let Value::Array(items) = entry {
            if !items.iter().any(|v| v.as_str() == Some(tag)) {
                items.push(Value::String(tag.to_string()));
            }
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    /// Compact JSON rendering.
    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns one message payload into zero or more events.
pub trait Codec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Vec<Event>, DecodeError>;
}

/// The whole payload becomes the `message` of one event.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl Codec for PlainCodec {
    fn decode(&self, payload: &[u8]) -> Result<Vec<Event>, DecodeError> {
        Ok(vec![Event::with_message(String::from_utf8_lossy(payload))])
    }
}

/// One event per line; `\n` and `\r\n` both end a line, empty lines are
/// skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCodec;

impl Codec for LineCodec {
    fn decode(&self, payload: &[u8]) -> Result<Vec<Event>, DecodeError> {
        let text = String::from_utf8_lossy(payload);
        Ok(text
            .lines()
            .filter(|line| !line.is_empty())
            .map(Event::with_message)
            .collect())
    }
}

/// A JSON object becomes one event, an array of objects one event each.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Codec for JsonCodec {
    fn decode(&self, payload: &[u8]) -> Result<Vec<Event>, DecodeError> {
        match serde_json::from_slice::<Value>(payload)? {
            Value::Object(fields) => Ok(vec![Event::from_map(fields)]),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(fields) => Ok(Event::from_map(fields)),
                    other => Err(DecodeError::NotAnObject(kind_of(&other))),
                })
                .collect(),
            other => Err(DecodeError::NotAnObject(kind_of(&other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Plain,
    Json,
    Line,
}

impl CodecKind {
    pub fn build(self) -> Box<dyn Codec> {
        match self {
            CodecKind::Plain => Box::new(PlainCodec),
            CodecKind::Json => Box::new(JsonCodec),
            CodecKind::Line => Box::new(LineCodec),
        }
    }
}

impl std::str::FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(CodecKind::Plain),
            "json" => Ok(CodecKind::Json),
            "line" => Ok(CodecKind::Line),
            other => Err(format!("unknown codec '{}'", other)),
        }
    }
}

/// Decodes payloads with the configured codec and stamps the connector's
/// identity onto the results.
pub struct EventEmitter {
    codec: Box<dyn Codec>,
    id: String,
    event_type: Option<String>,
    tags: Vec<String>,
    add_field: BTreeMap<String, String>,
}

impl EventEmitter {
    pub fn new(codec: Box<dyn Codec>, id: impl Into<String>) -> Self {
        Self {
            codec,
            id: id.into(),
            event_type: None,
            tags: Vec::new(),
            add_field: BTreeMap::new(),
        }
    }

    pub fn from_settings(settings: &StompSettings) -> Self {
        Self {
            codec: settings.codec.build(),
            id: settings.id.clone(),
            event_type: settings.event_type.clone(),
            tags: settings.tags.clone(),
            add_field: settings.add_field.clone(),
        }
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_field.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Vec<Event>, DecodeError> {
        self.codec.decode(payload)
    }

    /// Event carrying an undecodable payload verbatim.
    pub fn fallback(&self, payload: &[u8]) -> Event {
        let mut event = Event::with_message(String::from_utf8_lossy(payload));
        event.add_tag(DECODE_FAILURE_TAG);
        event
    }

    /// Attach `type`, tags, extra fields and `@metadata`.
    ///
    /// A `type` already present on the event is kept. An extra field that
    /// already exists is turned into an array holding both values.
    pub fn decorate(&self, event: &mut Event) {
        if let Some(t) = &self.event_type {
            if !event.contains("type") {
                event.set("type", t.as_str());
            }
        }
        for tag in &self.tags {
            event.add_tag(tag);
        }
        for (key, value) in &self.add_field {
            match event.0.get_mut(key) {
                None => event.set(key, value.as_str()),
                Some(Value::Array(items)) => items.push(Value::String(value.clone())),
                Some(existing) => {
                    let previous = existing.take();
                    *existing = Value::Array(vec![previous, Value::String(value.clone())]);
                }
            }
        }
        let metadata = event
            .0
            .entry("@metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(meta) = metadata {
            meta.insert("input".to_string(), Value::String(INPUT_NAME.to_string()));
            meta.insert("id".to_string(), Value::String(self.id.clone()));
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("tags", &self.tags)
            .field("add_field", &self.add_field)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_is_stamped() {
        let e = Event::new();
        assert_eq!(e.get_str("@version"), Some("1"));
        let ts = e.get_str("@timestamp").expect("timestamp");
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn plain_keeps_whole_payload() {
        let events = PlainCodec.decode(b"a\nb").expect("decode");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get_str("message"), Some("a\nb"));
    }

    #[test]
    fn line_splits_and_skips_blank_lines() {
        let events = LineCodec.decode(b"one\r\n\ntwo\n").expect("decode");
        let messages: Vec<_> = events.iter().filter_map(|e| e.get_str("message")).collect();
        assert_eq!(messages, vec!["one", "two"]);
        assert!(LineCodec.decode(b"").expect("decode").is_empty());
    }

    #[test]
    fn json_object_and_array() {
        let one = JsonCodec.decode(br#"{"a":1}"#).expect("decode");
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].get("a"), Some(&Value::from(1)));

        let many = JsonCodec.decode(br#"[{"a":1},{"a":2}]"#).expect("decode");
        assert_eq!(many.len(), 2);
    }

    #[test]
    fn json_rejects_scalars_and_garbage() {
        assert!(matches!(JsonCodec.decode(b"42"), Err(DecodeError::NotAnObject("number"))));
        assert!(matches!(JsonCodec.decode(br#"[{"a":1}, 2]"#), Err(DecodeError::NotAnObject(_))));
        assert!(matches!(JsonCodec.decode(b"{not json"), Err(DecodeError::Json(_))));
    }

    #[test]
    fn json_keeps_supplied_timestamp() {
        let events = JsonCodec
            .decode(br#"{"@timestamp":"2020-01-01T00:00:00Z"}"#)
            .expect("decode");
        assert_eq!(events[0].get_str("@timestamp"), Some("2020-01-01T00:00:00Z"));
    }

    #[test]
    fn decorate_adds_identity() {
        let emitter = EventEmitter::new(Box::new(PlainCodec), "in-1")
            .with_type("stomp")
            .with_tags(vec!["a".to_string(), "b".to_string()])
            .with_field("env", "prod");
        let mut event = Event::with_message("x");
        event.add_tag("a");
        emitter.decorate(&mut event);

        assert_eq!(event.get_str("type"), Some("stomp"));
        assert_eq!(event.tags(), vec!["a", "b"]);
        assert_eq!(event.get_str("env"), Some("prod"));
        let meta = event.get("@metadata").expect("metadata");
        assert_eq!(meta["input"], "stomp");
        assert_eq!(meta["id"], "in-1");
    }

    #[test]
    fn decorate_keeps_existing_type_and_merges_fields() {
        let emitter = EventEmitter::new(Box::new(PlainCodec), "stomp")
            .with_type("stomp")
            .with_field("env", "prod");
        let mut event = Event::new();
        event.set("type", "custom");
        event.set("env", "dev");
        emitter.decorate(&mut event);
        assert_eq!(event.get_str("type"), Some("custom"));
        assert_eq!(event.get("env"), Some(&serde_json::json!(["dev", "prod"])));
    }

    #[test]
    fn fallback_is_tagged() {
        let emitter = EventEmitter::new(Box::new(JsonCodec), "stomp");
        let event = emitter.fallback(b"{broken");
        assert_eq!(event.get_str("message"), Some("{broken"));
        assert_eq!(event.tags(), vec![DECODE_FAILURE_TAG]);
    }

    #[test]
    fn codec_kind_parses_names() {
        assert_eq!("JSON".parse::<CodecKind>(), Ok(CodecKind::Json));
        assert!("xml".parse::<CodecKind>().is_err());
    }
}
