//! The ingested event record
//!
//! A [`Fact`] is an arbitrarily shaped JSON object. Field order is preserved
//! so that a fact written to a log line reads the way it arrived.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FactError, Result};

/// One ingested event: an ordered mapping of field name to JSON value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fact(Map<String, Value>);

impl Fact {
    /// Create an empty fact
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a fact from a JSON document
    pub fn from_json_str(s: &str) -> Result<Self> {
        Self::from_slice(s.as_bytes())
    }

    /// Decode a fact from serialized bytes
    ///
    /// Empty input and JSON documents that are not objects are rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(FactError::EmptyPayload);
        }
        let value: Value = serde_json::from_slice(bytes)?;
        Self::try_from(value)
    }

    /// Serialize to compact JSON bytes
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Fact {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Fact {
    type Error = FactError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Err(FactError::NotAnObject("null")),
            Value::Bool(_) => Err(FactError::NotAnObject("boolean")),
            Value::Number(_) => Err(FactError::NotAnObject("number")),
            Value::String(_) => Err(FactError::NotAnObject("string")),
            Value::Array(_) => Err(FactError::NotAnObject("array")),
        }
    }
}

impl FromIterator<(String, Value)> for Fact {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_order_survives_reencoding() {
        let fact = Fact::from_json_str(r#"{"z":1,"a":2,"m":{"k":true}}"#).unwrap();
        let bytes = fact.to_vec().unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"z":1,"a":2,"m":{"k":true}}"#);

        let keys: Vec<&String> = fact.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(Fact::from_slice(b""), Err(FactError::EmptyPayload)));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(
            Fact::from_json_str("[1,2]"),
            Err(FactError::NotAnObject("array"))
        ));
        assert!(matches!(
            Fact::from_json_str("\"hello\""),
            Err(FactError::NotAnObject("string"))
        ));
        assert!(matches!(
            Fact::from_json_str("{not json"),
            Err(FactError::Serialization(_))
        ));
    }

    #[test]
    fn test_collect_from_pairs() {
        let fact: Fact = vec![
            ("user_id".to_string(), json!("u1")),
            ("count".to_string(), json!(3)),
        ]
        .into_iter()
        .collect();

        assert_eq!(fact.len(), 2);
        assert_eq!(fact.get("count"), Some(&json!(3)));
        assert!(!fact.is_empty());
        assert!(Fact::new().is_empty());
    }
}
