use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

/// Dynamic value type for node inputs/outputs. On the wire it is plain
/// JSON: graph payloads and results cross the HTTP boundary without any
/// enum tagging.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Json(serde_json::Value),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Json(j) => j.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Json(serde_json::Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(j) => Some(j),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null) || matches!(self, Value::Json(serde_json::Value::Null))
    }

    /// Truthiness as used by condition routing: null and false are falsy,
    /// as are zero, the empty string, and empty collections.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
            Value::Json(j) => match j {
                serde_json::Value::Null => false,
                serde_json::Value::Bool(b) => *b,
                serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
                serde_json::Value::String(s) => !s.is_empty(),
                serde_json::Value::Array(a) => !a.is_empty(),
                serde_json::Value::Object(o) => !o.is_empty(),
            },
        }
    }

    /// Render the value as text, the way the output node's `text` format
    /// and template substitution see it.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::String(s) => s.clone(),
            Value::Json(serde_json::Value::String(s)) => s.clone(),
            other => serde_json::to_string(&other.to_json()).unwrap_or_default(),
        }
    }

    /// Convert to a plain `serde_json::Value`, flattening the enum wrapper.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Json(j) => j.clone(),
            Value::Array(a) => serde_json::Value::Array(a.iter().map(|v| v.to_json()).collect()),
            Value::Object(o) => serde_json::Value::Object(
                o.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Convert a plain `serde_json::Value` into the closest `Value` variant.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => Value::Object(
                obj.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect(),
            ),
        }
    }

    /// Items of an array-like value, if it is one.
    pub fn as_array_items(&self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items.clone()),
            Value::Json(serde_json::Value::Array(items)) => {
                Some(items.iter().cloned().map(Value::from_json).collect())
            }
            _ => None,
        }
    }
}

/// Deep-merge `overlay` into `base`. Objects merge key-by-key with the
/// overlay winning on collision; every other pairing is replaced wholesale.
pub fn deep_merge(base: serde_json::Value, overlay: serde_json::Value) -> serde_json::Value {
    match (base, overlay) {
        (serde_json::Value::Object(mut a), serde_json::Value::Object(b)) => {
            for (key, overlay_value) in b {
                let merged = match a.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                a.insert(key, merged);
            }
            serde_json::Value::Object(a)
        }
        (_, overlay) => overlay,
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Value::from_json(serde_json::Value::deserialize(
            deserializer,
        )?))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        Value::Json(j)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::String("x".into()).is_truthy());
        assert!(Value::Json(json!([1])).is_truthy());
        assert!(!Value::Json(json!({})).is_truthy());
    }

    #[test]
    fn json_round_trip_flattens() {
        let v = Value::from_json(json!({"a": [1, "two", null]}));
        assert_eq!(v.to_json(), json!({"a": [1.0, "two", null]}));
    }

    #[test]
    fn deep_merge_overlay_wins() {
        let merged = deep_merge(
            json!({"a": 1, "nested": {"x": 1, "y": 2}}),
            json!({"b": 2, "nested": {"y": 3, "z": 4}}),
        );
        assert_eq!(merged, json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3, "z": 4}}));
    }

    #[test]
    fn deep_merge_replaces_mismatched_shapes() {
        let merged = deep_merge(json!({"a": {"x": 1}}), json!({"a": [1, 2]}));
        assert_eq!(merged, json!({"a": [1, 2]}));
    }

    #[test]
    fn number_text_drops_integral_fraction() {
        assert_eq!(Value::Number(42.0).to_text(), "42");
        assert_eq!(Value::Number(1.5).to_text(), "1.5");
    }

    #[test]
    fn wire_format_is_plain_json() {
        let v: Value = serde_json::from_str(r#"{"a": [1, "x"]}"#).unwrap();
        assert!(matches!(&v, Value::Object(_)));
        assert_eq!(serde_json::to_value(&v).unwrap(), json!({"a": [1.0, "x"]}));
    }
}
