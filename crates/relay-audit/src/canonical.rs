//! Canonical JSON for hashing: object keys sorted recursively, compact
//! separators, numbers as serde_json renders them, timestamps as RFC 3339
//! UTC strings. This form is the compatibility surface of the chain.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, val) in sorted {
                out.insert(key.clone(), canonicalize(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub fn canonical_string(value: &Value) -> String {
    // serde_json preserves insertion order for Map, so serializing the
    // sorted clone yields deterministic bytes with no extra whitespace.
    serde_json::to_string(&canonicalize(value)).unwrap_or_default()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
