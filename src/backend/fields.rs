//! Field extraction from request data.
//!
//! Every helper returns `Ok(None)` when the key is absent and `Err(message)`
//! when the value is present but malformed; the message becomes the
//! validation error returned to the client.

use std::time::Duration;

use serde_json::{Map, Value};

use proxyauth_core::parse_comma_list;

pub(crate) type FieldResult<T> = std::result::Result<Option<T>, String>;

/// A scalar coerced to a string (strings, numbers and bools).
pub(crate) fn string(data: &Map<String, Value>, key: &str) -> FieldResult<String> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(format!("{key}: expected a string, got {}", kind(other))),
    }
}

/// A comma-separated string or a list of scalars.
///
/// Elements are trimmed and empty elements dropped.
pub(crate) fn string_list(data: &Map<String, Value>, key: &str) -> FieldResult<Vec<String>> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(parse_comma_list(s))),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let s = match item {
                    Value::String(s) => s.trim().to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(format!("{key}: expected a list of strings, got {}", kind(other)));
                    }
                };
                if !s.is_empty() {
                    out.push(s);
                }
            }
            Ok(Some(out))
        }
        Some(other) => Err(format!("{key}: expected a list of strings, got {}", kind(other))),
    }
}

/// A map of header-like pairs, either an object or a `k=v,k2=v2` string.
///
/// Pairs come back in input order so the caller can detect collisions.
pub(crate) fn string_pairs(data: &Map<String, Value>, key: &str) -> FieldResult<Vec<(String, String)>> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => {
            let mut out = Vec::with_capacity(map.len());
            for (k, v) in map {
                let v = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    other => return Err(format!("{key}.{k}: expected a string, got {}", kind(other))),
                };
                out.push((k.clone(), v));
            }
            Ok(Some(out))
        }
        Some(Value::String(s)) => {
            let mut out = Vec::new();
            for pair in parse_comma_list(s) {
                let Some((k, v)) = pair.split_once('=') else {
                    return Err(format!("{key}: {pair:?} is not a key=value pair"));
                };
                out.push((k.trim().to_string(), v.trim().to_string()));
            }
            Ok(Some(out))
        }
        Some(other) => Err(format!("{key}: expected a map, got {}", kind(other))),
    }
}

/// A non-negative duration in seconds: an integer or a string holding either
/// an integer or a unit expression (`"90m"`, `"1h 30m"`).
pub(crate) fn duration_secs(data: &Map<String, Value>, key: &str) -> FieldResult<u64> {
    let negative = || format!("{key} cannot be negative");
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(secs) = n.as_u64() {
                Ok(Some(secs))
            } else if n.as_i64().is_some_and(|v| v < 0) || n.as_f64().is_some_and(|v| v < 0.0) {
                Err(negative())
            } else {
                Err(format!("{key}: {n} is not a whole number of seconds"))
            }
        }
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(Some(0));
            }
            if s.starts_with('-') {
                return Err(negative());
            }
            if let Ok(secs) = s.parse::<u64>() {
                return Ok(Some(secs));
            }
            crate::config::duration::parse(s)
                .map(|d: Duration| Some(d.as_secs()))
                .map_err(|e| format!("{key}: {e}"))
        }
        Some(other) => Err(format!("{key}: expected a duration, got {}", kind(other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
