//! Conversion between JSON and bridge values.
//!
//! Command-line arguments are parsed as JSON; anything that is not valid
//! JSON is passed as a plain string, so `tether call m.wasm greet -- world`
//! works without quoting.
//!
//! | JSON | value |
//! |------|-------|
//! | `null` | `Nil` |
//! | `true`/`false` | `Bool` |
//! | integer | `Integer` (floats and out-of-range integers become `Float`) |
//! | string | `String` |
//! | array | `Array` |
//! | object | `Map` with string keys, sorted by key |
//!
//! Results go the other way. Maps with non-string keys render as arrays of
//! `[key, value]` pairs; callback references render as
//! `{"callback": {"instance_id": .., "slot": ..}}`.

use serde_json::{Map, Number, Value, json};
use tether_core::DynamicValue;

/// Parse one command-line argument.
pub fn parse_arg(raw: &str) -> DynamicValue {
    match serde_json::from_str::<Value>(raw) {
        Ok(json) => json_to_value(&json),
        Err(_) => DynamicValue::from(raw),
    }
}

/// Convert a JSON document into a value.
pub fn json_to_value(json: &Value) -> DynamicValue {
    match json {
        Value::Null => DynamicValue::Nil,
        Value::Bool(b) => DynamicValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => DynamicValue::Integer(i),
            None => DynamicValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => DynamicValue::from(s.as_str()),
        Value::Array(items) => DynamicValue::Array(items.iter().map(json_to_value).collect()),
        Value::Object(fields) => DynamicValue::Map(
            fields
                .iter()
                .map(|(k, v)| (DynamicValue::from(k.as_str()), json_to_value(v)))
                .collect(),
        ),
    }
}

/// Convert a value into JSON for display.
pub fn value_to_json(value: &DynamicValue) -> Value {
    match value {
        DynamicValue::Nil => Value::Null,
        DynamicValue::Bool(b) => Value::Bool(*b),
        DynamicValue::Integer(i) => Value::Number((*i).into()),
        // JSON has no NaN or infinity.
        DynamicValue::Float(f) => Number::from_f64(*f).map_or_else(|| json!(f.to_string()), Value::Number),
        DynamicValue::String(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        DynamicValue::Array(items) => Value::Array(items.iter().map(value_to_json).collect()),
        DynamicValue::Map(entries) => {
            if entries.iter().all(|(k, _)| k.as_str().is_some()) {
                let mut object = Map::new();
                for (k, v) in entries {
                    if let Some(key) = k.as_str() {
                        object.insert(key.to_string(), value_to_json(v));
                    }
                }
                Value::Object(object)
            } else {
                Value::Array(
                    entries
                        .iter()
                        .map(|(k, v)| json!([value_to_json(k), value_to_json(v)]))
                        .collect(),
                )
            }
        }
        DynamicValue::Callback(callback) => json!({
            "callback": {
                "instance_id": callback.instance_id().get(),
                "slot": callback.slot(),
            }
        }),
    }
}
