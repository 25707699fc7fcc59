use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A message travelling over a topic.
///
/// Messages are open-ended keyed bags of fields.  The schema is identified by
/// the topic's message type (e.g. `"diagnostic_msgs/DiagnosticArray"`) and is
/// never enforced here; the connection or the remote peer rejects malformed
/// payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Set `field`, returning the previous value if there was one.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    /// Look up a field by name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert into a plain JSON object.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Message {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl TryFrom<Value> for Message {
    type Error = BusError;

    /// Only JSON objects are valid messages.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(BusError::InvalidMessage(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}

/// Lifecycle notifications emitted by a connection.
///
/// Topics never consume these; the hosting application observes them to
/// learn why an advertise or subscribe request failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    Connected,
    /// A transport or protocol-level failure reported by the remote end.
    Error(String),
    Closed,
}

/// Error type shared by connections, handles and topics.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Connection is not connected")]
    NotConnected,

    #[error("Type mismatch on {topic}: advertised as {advertised}, requested {requested}")]
    TypeMismatch {
        topic: String,
        advertised: String,
        requested: String,
    },

    /// A publisher or subscription handle was used after teardown.
    #[error("Handle already closed: {0}")]
    HandleClosed(String),

    #[error("No Tokio runtime available")]
    NoRuntime,

    #[error("Transport error: {0}")]
    Transport(String),
}
