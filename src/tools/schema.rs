//! Minimal tool-parameter schema validation.
//!
//! Deliberately a small enumerated subset rather than a general JSON-Schema
//! implementation: object schemas with `properties` / `required` /
//! `additionalProperties: false`, primitive member types (`string`,
//! `boolean`, `integer`, `number`, `object`) and arrays of strings. Anything
//! a declared tool needs beyond this belongs in the tool itself.

use serde_json::Value;

/// Validate `args` against a parameter schema. Returns human-readable issue
/// strings; empty means valid.
pub fn validate(params_schema: &Value, args: &Value) -> Vec<String> {
    let mut issues = Vec::new();

    let Some(args_obj) = args.as_object() else {
        return vec!["arguments must be a JSON object".to_string()];
    };

    if params_schema.get("type").and_then(Value::as_str) != Some("object") {
        return issues;
    }

    let empty = serde_json::Map::new();
    let props = params_schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    if let Some(required) = params_schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_obj.contains_key(key) {
                issues.push(format!("missing required field: {key}"));
            }
        }
    }

    if params_schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        let mut extra: Vec<&String> =
            args_obj.keys().filter(|k| !props.contains_key(*k)).collect();
        extra.sort();
        for key in extra {
            issues.push(format!("unexpected field: {key}"));
        }
    }

    for (key, schema) in props {
        let Some(value) = args_obj.get(key) else { continue };
        let Some(expected) = schema.get("type").and_then(Value::as_str) else { continue };
        match expected {
            "string" => {
                if !value.is_string() {
                    issues.push(format!("{key} must be a string"));
                }
            }
            "boolean" => {
                if !value.is_boolean() {
                    issues.push(format!("{key} must be a boolean"));
                }
            }
            "integer" => {
                if !value.is_i64() && !value.is_u64() {
                    issues.push(format!("{key} must be an integer"));
                }
            }
            "number" => {
                if !value.is_number() {
                    issues.push(format!("{key} must be a number"));
                }
            }
            "object" => {
                if !value.is_object() {
                    issues.push(format!("{key} must be an object"));
                }
            }
            "array" => match value.as_array() {
                None => issues.push(format!("{key} must be an array")),
                Some(items) => {
                    let item_type = schema
                        .get("items")
                        .and_then(|i| i.get("type"))
                        .and_then(Value::as_str);
                    if item_type == Some("string") && !items.iter().all(Value::is_string) {
                        issues.push(format!("{key} items must be strings"));
                    }
                }
            },
            _ => {}
        }
    }

    issues
}
