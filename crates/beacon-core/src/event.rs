//! Event value types.
//!
//! An [`Event`] is immutable once built. All caller-supplied values pass
//! through [`normalize`] so the queue only ever stores plain JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::SessionId;

/// Insertion-ordered property map.
pub type Properties = Map<String, Value>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    #[error("event name must not be empty")]
    EmptyName,
}

/// Host-supplied device metadata, embedded verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceContext(Value);

impl DeviceContext {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self(Value::Object(Map::new()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    name: String,
    properties: Properties,
    timestamp: i64,
    session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default)]
    device_context: DeviceContext,
    #[serde(default)]
    user_properties: Properties,
}

impl Event {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn device_context(&self) -> &DeviceContext {
        &self.device_context
    }

    pub fn user_properties(&self) -> &Properties {
        &self.user_properties
    }

    /// Consume the event and return a copy carrying `properties`.
    pub fn with_properties(self, properties: Properties) -> Self {
        Self { properties, ..self }
    }
}

/// Per-process state stamped onto every event at build time.
#[derive(Clone, Debug)]
pub struct EventContext {
    pub session_id: SessionId,
    pub user_id: Option<String>,
    pub device_context: DeviceContext,
    pub user_properties: Properties,
    pub now_ms: i64,
}

#[derive(Clone, Debug, Default)]
pub struct EventBuilder {
    name: String,
    properties: Properties,
    user_properties: Properties,
    timestamp: Option<i64>,
}

impl EventBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        self.name.trim()
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.properties.insert(key.into(), normalize(value));
        self
    }

    pub fn properties<K, V, I>(mut self, props: I) -> Self
    where
        K: Into<String>,
        V: Serialize,
        I: IntoIterator<Item = (K, V)>,
    {
        for (k, v) in props {
            self.properties.insert(k.into(), normalize(v));
        }
        self
    }

    pub fn user_property(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.user_properties.insert(key.into(), normalize(value));
        self
    }

    /// Override the event time. Defaults to the context's `now_ms`.
    pub fn timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    /// Builder-level user properties win over the context's on key collision.
    pub fn build(self, ctx: EventContext) -> Result<Event, EventError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(EventError::EmptyName);
        }
        let mut user_properties = ctx.user_properties;
        user_properties.extend(self.user_properties);
        Ok(Event {
            name: name.to_owned(),
            properties: self.properties,
            timestamp: self.timestamp.unwrap_or(ctx.now_ms),
            session_id: ctx.session_id,
            user_id: ctx.user_id,
            device_context: ctx.device_context,
            user_properties,
        })
    }
}

/// Convert any serializable value into the closed JSON value type.
/// Values that cannot be represented become `null`.
pub fn normalize<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
