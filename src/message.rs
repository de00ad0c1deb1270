//! Payment event messages.
//!
//! A message is a flat, ordered JSON object describing one payment event. Messages are
//! identified operationally by the `(gateway, order_id)` pair rather than by a single key.
//!
//! The `source_*` keys are reserved: they are stamped once when a message is first pushed
//! onto a queue (see [`SourceFields`]) and are never overwritten afterwards.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Config;

pub const SOURCE_ENQUEUED_TIME: &str = "source_enqueued_time";
pub const SOURCE_NAME: &str = "source_name";
pub const SOURCE_TYPE: &str = "source_type";
pub const SOURCE_HOST: &str = "source_host";
pub const SOURCE_RUN_ID: &str = "source_run_id";
pub const SOURCE_VERSION: &str = "source_version";

/// Key holding the raw body of an envelope that could not be parsed as a message.
pub const RAW_ENVELOPE: &str = "raw_envelope";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a queue envelope. Anything other than a JSON object is rejected.
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns a scalar field as a string. Numbers are formatted, empty strings count as absent.
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Returns a field as epoch seconds, accepting numbers and numeric strings. Fractional
    /// values are truncated.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate)),
            Value::String(s) => s
                .parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(truncate)),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn gateway(&self) -> Option<String> {
        self.get_string("gateway")
    }

    pub fn order_id(&self) -> Option<String> {
        self.get_string("order_id")
    }

    pub fn gateway_txn_id(&self) -> Option<String> {
        self.get_string("gateway_txn_id")
    }

    pub fn source_enqueued_time(&self) -> Option<i64> {
        self.get_i64(SOURCE_ENQUEUED_TIME)
    }

    /// Returns `source_enqueued_time`, stamping it with `now` first if the message has none.
    ///
    /// A present value is never replaced. `None` means the field exists but is not a
    /// timestamp.
    pub fn ensure_source_enqueued_time(&mut self, now: i64) -> Option<i64> {
        if !self.contains_key(SOURCE_ENQUEUED_TIME) {
            self.insert(SOURCE_ENQUEUED_TIME, now);
            return Some(now);
        }
        self.source_enqueued_time()
    }

    /// Timestamp the payment event originally happened at, if the message carries one.
    pub fn original_date(&self) -> Option<i64> {
        self.get_i64("date").or_else(|| self.source_enqueued_time())
    }

    /// Overlays every field of `other` onto this message. Fields only present here are kept.
    pub fn merge(&mut self, other: &Message) {
        for (key, value) in other.0.iter() {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Cheap structural check run before any action touches the message.
    pub fn validate(&self) -> bool {
        self.gateway().is_some() && self.order_id().is_some()
    }
}

fn truncate(value: f64) -> Option<i64> {
    (value.is_finite() && value.abs() < i64::MAX as f64).then(|| value.trunc() as i64)
}

impl From<Map<String, Value>> for Message {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl TryFrom<Value> for Message {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::from_value(value)
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        Value::Object(message.0)
    }
}

/// Provenance fields stamped onto a message when it is first pushed onto a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFields {
    pub name: String,
    pub kind: String,
    pub host: String,
    pub run_id: u32,
    pub version: String,
}

impl SourceFields {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.source_name.clone(),
            kind: config.source_type.clone(),
            host: config
                .source_host
                .clone()
                .unwrap_or_else(|| "localhost".to_owned()),
            run_id: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// Adds each source field the message does not carry yet. Existing values are never
    /// replaced, so a message keeps the provenance of its first ingestion across requeues.
    pub fn add_to_message(&self, message: &mut Message, now: i64) {
        let fields: [(&str, Value); 6] = [
            (SOURCE_NAME, self.name.clone().into()),
            (SOURCE_TYPE, self.kind.clone().into()),
            (SOURCE_HOST, self.host.clone().into()),
            (SOURCE_RUN_ID, self.run_id.into()),
            (SOURCE_VERSION, self.version.clone().into()),
            (SOURCE_ENQUEUED_TIME, now.into()),
        ];

        for (key, value) in fields {
            if !message.contains_key(key) {
                message.insert(key, value);
            }
        }
    }
}
