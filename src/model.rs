//! Captured request/response shapes persisted to and replayed from storage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A header, query-param, or form-field value: a single string for a
/// field that appeared once, a list for a field repeated in the wire
/// representation. Mirrors Go's `getValue([]string) interface{}`
/// scalar-or-list collapse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Single(String),
    Multi(Vec<String>),
}

impl Value {
    /// Fold a list of values the way `getValue` does: one element becomes
    /// a bare string, anything else stays a list (including empty, which
    /// should not normally occur).
    pub fn from_values(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            Value::Single(values.remove(0))
        } else {
            Value::Multi(values)
        }
    }

    pub fn first(&self) -> Option<&str> {
        match self {
            Value::Single(s) => Some(s),
            Value::Multi(v) => v.first().map(String::as_str),
        }
    }
}

pub type ValueMap = BTreeMap<String, Value>;

/// A captured HTTP request, ready for JSON persistence and for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub get_params: ValueMap,
    pub headers: ValueMap,
    pub cookies: BTreeMap<String, String>,
    pub post_params: ValueMap,
    pub raw: String,
    pub is_https: bool,
}

/// A captured HTTP response, ready for JSON persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub code: u16,
    pub message: String,
    pub headers: ValueMap,
    pub body: String,
    pub raw: String,
    pub is_https: bool,
}

/// A captured request joined with its assigned id, as returned by the
/// replay API's listing and single-request endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: i64,
    #[serde(flatten)]
    pub request: CapturedRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_single_collapse() {
        let v = Value::from_values(vec!["a".to_string()]);
        assert_eq!(v, Value::Single("a".to_string()));
    }

    #[test]
    fn test_value_multi_preserved() {
        let v = Value::from_values(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(v, Value::Multi(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_value_json_shape() {
        let single = Value::Single("x".to_string());
        assert_eq!(serde_json::to_string(&single).unwrap(), "\"x\"");

        let multi = Value::Multi(vec!["x".to_string(), "y".to_string()]);
        assert_eq!(serde_json::to_string(&multi).unwrap(), "[\"x\",\"y\"]");
    }

    #[test]
    fn test_captured_request_round_trip() {
        let req = CapturedRequest {
            method: "GET".into(),
            path: "/foo".into(),
            get_params: ValueMap::new(),
            headers: ValueMap::new(),
            cookies: BTreeMap::new(),
            post_params: ValueMap::new(),
            raw: "GET /foo HTTP/1.1\r\n\r\n".into(),
            is_https: false,
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: CapturedRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.raw, req.raw);
    }
}
