//! Task payloads and their JSON wire encoding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::PayloadError;

/// String-keyed bag of values handed to a task handler.
///
/// Always encoded as a JSON object on the wire, regardless of transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskPayload(Map<String, JsonValue>);

impl TaskPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Option<JsonValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Convenience accessor for string values.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Map<String, JsonValue> {
        self.0
    }

    /// Deserialize the whole payload into a typed struct.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, PayloadError> {
        Ok(serde_json::from_value(JsonValue::Object(self.0.clone()))?)
    }

    /// Build a payload from any serializable value that renders as a JSON object.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, PayloadError> {
        Self::try_from(serde_json::to_value(value)?)
    }

    /// Encode for transport.
    pub fn to_wire(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    /// Decode from transport bytes.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, PayloadError> {
        let value: JsonValue = serde_json::from_slice(bytes)?;
        Self::try_from(value)
    }
}

impl From<Map<String, JsonValue>> for TaskPayload {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

impl TryFrom<JsonValue> for TaskPayload {
    type Error = PayloadError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        match value {
            JsonValue::Object(map) => Ok(Self(map)),
            JsonValue::Null => Err(PayloadError::NotAnObject("null")),
            JsonValue::Bool(_) => Err(PayloadError::NotAnObject("bool")),
            JsonValue::Number(_) => Err(PayloadError::NotAnObject("number")),
            JsonValue::String(_) => Err(PayloadError::NotAnObject("string")),
            JsonValue::Array(_) => Err(PayloadError::NotAnObject("array")),
        }
    }
}

impl FromIterator<(String, JsonValue)> for TaskPayload {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
