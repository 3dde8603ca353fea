//! Canonical JSON and request hashing.
//!
//! `serde_json` is built with default features, so `serde_json::Map` is a
//! `BTreeMap` — object keys serialize in sorted order and `to_string` uses
//! compact separators. That makes plain serialization of a rebuilt `Value`
//! canonical: two semantically equal payloads hash identically regardless of
//! the key order they arrived in.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a value canonically (sorted keys, compact separators).
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Recursively remove `null` members from objects.
///
/// Used when persisting transcripts and forwarding upstream payloads: string
/// content is kept verbatim, structured content is embedded as its JSON value,
/// and absent optional fields do not appear at all.
pub fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// Lowercase hex sha256 of a string.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Deterministic hash of one tool request: `sha256(canonical({tool, version,
/// arguments}))`. Identifies the semantic request for replay correlation.
pub fn request_hash(tool: &str, version: &str, args: &Value) -> String {
    let payload = serde_json::json!({
        "arguments": args,
        "tool": tool,
        "version": version,
    });
    sha256_hex(&canonical_json(&payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let v: Value = serde_json::from_str(r#"{"b":1,"a":{"z":2,"y":3}}"#).unwrap();
        assert_eq!(canonical_json(&v), r#"{"a":{"y":3,"z":2},"b":1}"#);
    }

    #[test]
    fn request_hash_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":[1,2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":[1,2],"x":1}"#).unwrap();
        assert_eq!(request_hash("noop", "1", &a), request_hash("noop", "1", &b));
    }

    #[test]
    fn request_hash_differs_for_different_tools() {
        let args = json!({ "text": "x" });
        assert_ne!(
            request_hash("noop", "1", &args),
            request_hash("shell", "1", &args)
        );
    }

    #[test]
    fn request_hash_is_stable_across_calls() {
        let args = json!({ "text": "x" });
        assert_eq!(
            request_hash("noop", "1", &args),
            request_hash("noop", "1", &args)
        );
    }

    #[test]
    fn strip_nulls_removes_object_nulls_recursively() {
        let v = json!({ "a": null, "b": { "c": null, "d": 1 }, "e": [null, {"f": null}] });
        let stripped = strip_nulls(v);
        assert_eq!(stripped, json!({ "b": { "d": 1 }, "e": [null, {}] }));
    }
}
