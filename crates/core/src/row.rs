//! Helpers for reading raw key-value rows returned by the relational store.
//!
//! Rows arrive as loosely-typed JSON objects. Required fields fail fast with
//! a `Validation` error instead of defaulting silently.

use serde_json::Value;

use crate::error::{DispatchError, DispatchResult};

pub type Row = serde_json::Map<String, Value>;

pub fn req_str(row: &Row, key: &str) -> DispatchResult<String> {
    match row.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Null) | None => Err(missing(key)),
        Some(other) => Err(wrong_type(key, "string", other)),
    }
}

pub fn opt_str(row: &Row, key: &str) -> DispatchResult<Option<String>> {
    match row.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
        Some(Value::String(_)) | Some(Value::Null) | None => Ok(None),
        Some(other) => Err(wrong_type(key, "string", other)),
    }
}

pub fn req_f64(row: &Row, key: &str) -> DispatchResult<f64> {
    match row.get(key) {
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| wrong_type(key, "number", &Value::Number(n.clone()))),
        Some(Value::Null) | None => Err(missing(key)),
        Some(other) => Err(wrong_type(key, "number", other)),
    }
}

pub fn opt_f64(row: &Row, key: &str) -> DispatchResult<Option<f64>> {
    match row.get(key) {
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(wrong_type(key, "number", other)),
    }
}

pub fn req_u64(row: &Row, key: &str) -> DispatchResult<u64> {
    match row.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| wrong_type(key, "unsigned integer", &Value::Number(n.clone()))),
        Some(Value::Null) | None => Err(missing(key)),
        Some(other) => Err(wrong_type(key, "unsigned integer", other)),
    }
}

pub fn opt_u64(row: &Row, key: &str) -> DispatchResult<Option<u64>> {
    match row.get(key) {
        Some(Value::Number(n)) => Ok(n.as_u64()),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(wrong_type(key, "unsigned integer", other)),
    }
}

pub fn opt_bool(row: &Row, key: &str, default: bool) -> DispatchResult<bool> {
    match row.get(key) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Null) | None => Ok(default),
        Some(other) => Err(wrong_type(key, "bool", other)),
    }
}

fn missing(key: &str) -> DispatchError {
    DispatchError::validation(format!("missing required field `{key}`"))
}

fn wrong_type(key: &str, expected: &str, got: &Value) -> DispatchError {
    DispatchError::validation(format!(
        "field `{key}` is not a {expected} (got {got})"
    ))
}
