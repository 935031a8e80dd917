//! Canonical encoding and content hashing for cache keys.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Encode `value` as JSON with object keys sorted at every depth.
///
/// Two values that serialize to equal JSON trees always produce identical strings,
/// regardless of struct field order or map insertion order.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value).context("serialize step input")?;
    serde_json::to_string(&sorted(value)).context("encode canonical json")
}

/// Full SHA-256 fingerprint (hex) of the canonical encoding of `value`.
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String> {
    let encoded = canonical_json(value)?;
    Ok(hex::encode(Sha256::digest(encoded.as_bytes())))
}

/// Compute a short hash of content for file names and ids.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..8])
}

fn sorted(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = Map::new();
            for (key, value) in entries {
                out.insert(key, sorted(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}
