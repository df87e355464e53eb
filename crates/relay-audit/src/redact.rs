use regex::Regex;
use serde_json::{json, Map, Value};

use crate::canonical::sha256_hex;

/// Key names that always carry credentials, compared case-insensitively and
/// ignoring `-`/`_` differences.
const SECRET_KEY_NAMES: &[&str] = &[
    "authorization",
    "api_key",
    "apikey",
    "access_token",
    "refresh_token",
    "token",
    "secret",
    "password",
    "passphrase",
    "private_key",
    "routing_key",
    "x_api_key",
];

/// Minimum length before value-pattern redaction applies; short strings that
/// merely look entropic are left alone.
const VALUE_PATTERN_MIN_LEN: usize = 20;

/// Replaces secret material with `{"redacted": sha256(value + salt)}` so a
/// reader can verify a value was present (and compare two redactions) without
/// learning its content. Applied before hashing, logging, and responses.
#[derive(Clone)]
pub struct Redactor {
    salt: String,
    value_patterns: Vec<Regex>,
}

impl Redactor {
    pub fn new(salt: impl Into<String>) -> Self {
        let value_patterns = [
            // Bearer/basic credentials embedded in strings.
            r"(?i)^(bearer|basic)\s+\S+$",
            // Common provider key prefixes.
            r"^(sk|pk|rk|ghp|gho|xox[bap])[-_][A-Za-z0-9_-]+$",
            // PEM blocks.
            r"-----BEGIN [A-Z ]*PRIVATE KEY-----",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();
        Self {
            salt: salt.into(),
            value_patterns,
        }
    }

    pub fn with_value_pattern(mut self, pattern: &str) -> Self {
        if let Ok(re) = Regex::new(pattern) {
            self.value_patterns.push(re);
        }
        self
    }

    /// Recursive redaction over maps and arrays. `extra_secret_keys` carries
    /// the arg names the adapter schema marks `secret`.
    pub fn redact(&self, value: &Value, extra_secret_keys: &[String]) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, val) in map {
                    if self.is_secret_key(key, extra_secret_keys) {
                        out.insert(key.clone(), self.marker(val));
                    } else {
                        out.insert(key.clone(), self.redact(val, extra_secret_keys));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.redact(item, extra_secret_keys))
                    .collect(),
            ),
            Value::String(s) => {
                if s.len() > VALUE_PATTERN_MIN_LEN
                    && self.value_patterns.iter().any(|re| re.is_match(s))
                {
                    self.marker(value)
                } else {
                    value.clone()
                }
            }
            other => other.clone(),
        }
    }

    fn is_secret_key(&self, key: &str, extra: &[String]) -> bool {
        let normalized: String = key
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        SECRET_KEY_NAMES.contains(&normalized.as_str())
            || extra.iter().any(|k| k.eq_ignore_ascii_case(key))
    }

    fn marker(&self, value: &Value) -> Value {
        let raw = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        json!({"redacted": sha256_hex(format!("{raw}{}", self.salt).as_bytes())})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_credential_keys_recursively() {
        let redactor = Redactor::new("salt-1");
        let value = json!({
            "title": "X",
            "headers": {"Authorization": "Bearer abc", "Accept": "json"},
            "nested": [{"password": "hunter2"}]
        });
        let redacted = redactor.redact(&value, &[]);
        assert_eq!(redacted["title"], "X");
        assert!(redacted["headers"]["Authorization"]["redacted"].is_string());
        assert_eq!(redacted["headers"]["Accept"], "json");
        assert!(redacted["nested"][0]["password"]["redacted"].is_string());
    }

    #[test]
    fn redacts_schema_marked_args() {
        let redactor = Redactor::new("salt-1");
        let value = json!({"routing_key": "RK123", "summary": "S"});
        let redacted = redactor.redact(&value, &["routing_key".to_string()]);
        assert!(redacted["routing_key"]["redacted"].is_string());
        assert_eq!(redacted["summary"], "S");
    }

    #[test]
    fn redacts_long_credential_shaped_values() {
        let redactor = Redactor::new("salt-1");
        let value = json!({"note": "sk-abcdefghijklmnopqrstuvwx"});
        let redacted = redactor.redact(&value, &[]);
        assert!(redacted["note"]["redacted"].is_string());
        // Short lookalikes survive.
        let short = redactor.redact(&json!({"note": "sk-short"}), &[]);
        assert_eq!(short["note"], "sk-short");
    }

    #[test]
    fn marker_is_salted_and_deterministic() {
        let a = Redactor::new("salt-a");
        let b = Redactor::new("salt-b");
        let value = json!({"token": "same-value"});
        let one = a.redact(&value, &[]);
        let two = a.redact(&value, &[]);
        let other_salt = b.redact(&value, &[]);
        assert_eq!(one, two);
        assert_ne!(one["token"]["redacted"], other_salt["token"]["redacted"]);
    }
}
