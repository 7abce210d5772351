use crate::{is_credential_key, Value};
use std::collections::HashMap;

/// Placeholder substituted for any occurrence of an injected credential.
pub const REDACTED: &str = "[redacted]";

/// Replaces injected credential values with a placeholder in everything the
/// engine returns. Built once per run from the run's input map; applied on
/// every exit path, success and failure alike.
#[derive(Clone, Default)]
pub struct SecretRedactor {
    secrets: Vec<String>,
}

impl SecretRedactor {
    /// Collect every credential string placed under a reserved input key.
    /// Trivially short values are ignored so a one-character secret cannot
    /// shred unrelated output.
    pub fn from_inputs(inputs: &HashMap<String, Value>) -> Self {
        let mut secrets: Vec<String> = inputs
            .iter()
            .filter(|(key, _)| is_credential_key(key))
            .filter_map(|(_, value)| value.as_str().map(str::to_string))
            .filter(|s| s.len() >= 4)
            .collect();
        // Longest first, so overlapping secrets redact completely.
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn redact_str(&self, input: &str) -> String {
        let mut out = input.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }

    /// Deep-scan a value, including nested structures.
    pub fn redact_value(&self, value: &Value) -> Value {
        if self.secrets.is_empty() {
            return value.clone();
        }
        match value {
            Value::String(s) => Value::String(self.redact_str(s)),
            Value::Json(j) => Value::Json(self.redact_json(j)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.redact_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn redact_json(&self, json: &serde_json::Value) -> serde_json::Value {
        match json {
            serde_json::Value::String(s) => serde_json::Value::String(self.redact_str(s)),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.redact_json(v)).collect())
            }
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_key;
    use serde_json::json;

    fn redactor_with(secret: &str) -> SecretRedactor {
        let mut inputs = HashMap::new();
        inputs.insert(credential_key("ai1"), Value::String(secret.to_string()));
        inputs.insert("prompt".to_string(), Value::String("hello".to_string()));
        SecretRedactor::from_inputs(&inputs)
    }

    #[test]
    fn only_reserved_keys_become_secrets() {
        let redactor = redactor_with("sk-test-12345");
        assert_eq!(redactor.redact_str("say hello"), "say hello");
        assert_eq!(
            redactor.redact_str("bearer sk-test-12345 sent"),
            format!("bearer {REDACTED} sent")
        );
    }

    #[test]
    fn nested_structures_are_scanned() {
        let redactor = redactor_with("sk-test-12345");
        let value = Value::Json(json!({
            "headers": {"authorization": "Bearer sk-test-12345"},
            "items": ["ok", "sk-test-12345"]
        }));
        let redacted = redactor.redact_value(&value);
        let json = redacted.to_json();
        assert_eq!(json["headers"]["authorization"], format!("Bearer {REDACTED}"));
        assert_eq!(json["items"][1], REDACTED);
    }

    #[test]
    fn overlapping_secrets_redact_longest_first() {
        let mut inputs = HashMap::new();
        inputs.insert(credential_key("a"), Value::String("secret".into()));
        inputs.insert(credential_key("b"), Value::String("secret-extended".into()));
        let redactor = SecretRedactor::from_inputs(&inputs);
        assert_eq!(redactor.redact_str("x secret-extended y"), format!("x {REDACTED} y"));
    }

    #[test]
    fn short_secrets_are_ignored() {
        let redactor = redactor_with("ab");
        assert_eq!(redactor.redact_str("lab report"), "lab report");
    }
}
