//! Field decoders for values the API sends in more than one shape.
//!
//! Balances and OHLC prices arrive as JSON numbers or decimal strings, and
//! flags arrive as `true`/`false` or `0`/`1`.

use serde::de::{Deserializer, Error};
use serde::Deserialize;
use serde_json::Value;

fn value_to_f64<E: Error>(value: &Value) -> Result<Option<f64>, E> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| E::custom(format!("number out of range: {n}"))),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| E::custom(format!("not a decimal: {s:?}"))),
        other => Err(E::custom(format!("expected number, got {other}"))),
    }
}

pub fn f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    value_to_f64(&value)?.ok_or_else(|| D::Error::custom("missing number"))
}

pub fn opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    value_to_f64(&value)
}

pub fn bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(false),
        Value::Bool(b) => Ok(b),
        Value::Number(n) => Ok(n.as_f64().map(|v| v != 0.0).unwrap_or(false)),
        Value::String(s) => match s.as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" | "" => Ok(false),
            other => Err(D::Error::custom(format!("not a flag: {other:?}"))),
        },
        other => Err(D::Error::custom(format!("expected flag, got {other}"))),
    }
}

/// Identifiers the API sometimes sends as strings and sometimes as numbers.
pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("expected string, got {other}"))),
    }
}
