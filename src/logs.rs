//! Inbound log data model.
//!
//! Mirrors the shape of an OpenTelemetry logs payload: resources own scopes,
//! scopes own log records, and every record is read together with the
//! attribute set of the resource it belongs to.

use std::collections::HashMap;
use std::fmt;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;

/// An attribute or body value.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Double(f64),
    Bytes(Vec<u8>),
    Array(Vec<AnyValue>),
    Map(Attributes),
}

impl AnyValue {
    /// Render the value as a string.
    ///
    /// Scalars are printed plainly, bytes as standard base64 and
    /// arrays/maps as compact JSON.
    pub fn as_string(&self) -> String {
        match self {
            AnyValue::Str(s) => s.clone(),
            AnyValue::Bool(b) => b.to_string(),
            AnyValue::Int(i) => i.to_string(),
            AnyValue::Double(d) => d.to_string(),
            AnyValue::Bytes(b) => base64::engine::general_purpose::STANDARD.encode(b),
            AnyValue::Array(_) | AnyValue::Map(_) => self.to_json().to_string(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            AnyValue::Str(s) => serde_json::Value::String(s.clone()),
            AnyValue::Bool(b) => serde_json::Value::Bool(*b),
            AnyValue::Int(i) => serde_json::Value::from(*i),
            AnyValue::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AnyValue::Bytes(_) => serde_json::Value::String(self.as_string()),
            AnyValue::Array(values) => {
                serde_json::Value::Array(values.iter().map(AnyValue::to_json).collect())
            }
            AnyValue::Map(attributes) => serde_json::Value::Object(
                attributes
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for AnyValue {
    fn from(value: &str) -> Self {
        AnyValue::Str(value.to_string())
    }
}

impl From<String> for AnyValue {
    fn from(value: String) -> Self {
        AnyValue::Str(value)
    }
}

impl From<i64> for AnyValue {
    fn from(value: i64) -> Self {
        AnyValue::Int(value)
    }
}

impl From<bool> for AnyValue {
    fn from(value: bool) -> Self {
        AnyValue::Bool(value)
    }
}

impl<'de> Deserialize<'de> for AnyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AnyValueVisitor)
    }
}

struct AnyValueVisitor;

impl<'de> Visitor<'de> for AnyValueVisitor {
    type Value = AnyValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an attribute value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<AnyValue, E> {
        Ok(AnyValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<AnyValue, E> {
        Ok(AnyValue::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<AnyValue, E> {
        Ok(i64::try_from(v)
            .map(AnyValue::Int)
            .unwrap_or(AnyValue::Double(v as f64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<AnyValue, E> {
        Ok(AnyValue::Double(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<AnyValue, E> {
        Ok(AnyValue::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<AnyValue, E> {
        Ok(AnyValue::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<AnyValue, E> {
        Ok(AnyValue::Bytes(v.to_vec()))
    }

    fn visit_unit<E: de::Error>(self) -> Result<AnyValue, E> {
        Ok(AnyValue::Str(String::new()))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<AnyValue, A::Error> {
        let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(value) = seq.next_element()? {
            values.push(value);
        }
        Ok(AnyValue::Array(values))
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<AnyValue, A::Error> {
        AttributesVisitor.visit_map(map).map(AnyValue::Map)
    }
}

/// Ordered set of attribute key/value pairs.
///
/// Keys are unique; insertion order is kept.
#[derive(Clone, Default)]
pub struct Attributes {
    entries: Vec<(String, AnyValue)>,
    index: HashMap<String, usize>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an attribute by key.
    pub fn get(&self, key: &str) -> Option<&AnyValue> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    /// Insert an attribute, replacing the value of an existing key in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AnyValue>) {
        let key = key.into();
        let value = value.into();
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<AnyValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AnyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl PartialEq for Attributes {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<'de> Deserialize<'de> for Attributes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(AttributesVisitor)
    }
}

struct AttributesVisitor;

impl<'de> Visitor<'de> for AttributesVisitor {
    type Value = Attributes;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of attributes")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Attributes, A::Error> {
        let mut attributes = Attributes::new();
        while let Some((key, value)) = map.next_entry::<String, AnyValue>()? {
            attributes.insert(key, value);
        }
        Ok(attributes)
    }
}

/// Entity that produced a group of log records.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub attributes: Attributes,
}

impl Resource {
    pub fn new(attributes: Attributes) -> Self {
        Self { attributes }
    }
}

/// A single structured log record.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LogRecord {
    /// Time the event occurred
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    /// Time the event was observed by the pipeline
    #[serde(default)]
    pub observed_timestamp: Option<DateTime<Utc>>,

    /// Severity as text (e.g. "INFO")
    #[serde(default)]
    pub severity_text: String,

    /// Log body
    #[serde(default)]
    pub body: Option<AnyValue>,

    /// Record-level attributes
    #[serde(default)]
    pub attributes: Attributes,
}

impl LogRecord {
    /// Create a record with a severity and a string body.
    pub fn new(severity_text: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity_text: severity_text.into(),
            body: Some(AnyValue::Str(body.into())),
            ..Self::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AnyValue>) -> Self {
        self.attributes.insert(key, value);
        self
    }
}

/// Records emitted by one instrumentation scope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScopeLogs {
    #[serde(default)]
    pub log_records: Vec<LogRecord>,
}

/// Records grouped under the resource that produced them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResourceLogs {
    #[serde(default)]
    pub resource: Resource,

    #[serde(default)]
    pub scope_logs: Vec<ScopeLogs>,
}

impl ResourceLogs {
    /// Single-scope convenience constructor.
    pub fn new(resource: Resource, log_records: Vec<LogRecord>) -> Self {
        Self {
            resource,
            scope_logs: vec![ScopeLogs { log_records }],
        }
    }
}

/// A batch of log records as handed over by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Logs {
    #[serde(default)]
    pub resource_logs: Vec<ResourceLogs>,
}

impl Logs {
    pub fn new(resource_logs: Vec<ResourceLogs>) -> Self {
        Self { resource_logs }
    }

    /// Total number of log records in the batch.
    pub fn record_count(&self) -> usize {
        self.resource_logs
            .iter()
            .flat_map(|rl| rl.scope_logs.iter())
            .map(|sl| sl.log_records.len())
            .sum()
    }

    /// Iterate every record with its owning resource, in input order.
    pub fn records(&self) -> impl Iterator<Item = (&Resource, &LogRecord)> {
        self.resource_logs.iter().flat_map(|rl| {
            rl.scope_logs
                .iter()
                .flat_map(move |sl| sl.log_records.iter().map(move |lr| (&rl.resource, lr)))
        })
    }
}
