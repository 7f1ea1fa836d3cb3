//! Coercion rules shared by the comparison operators.
//!
//! Records are dynamically typed, so comparisons follow the permissive rules
//! users expect from a scripting language: numeric strings compare equal to
//! numbers under loose equality, `null` is falsy, and so on.

use serde_json::Value;
use std::cmp::Ordering;

/// Loose equality: coerces between numbers, numeric strings and booleans.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Bool(_), Value::Bool(_))
        | (Value::Number(_), Value::Number(_))
        | (Value::String(_), Value::String(_))
        | (Value::Array(_), Value::Array(_))
        | (Value::Object(_), Value::Object(_)) => strict_eq(a, b),
        (Value::Bool(flag), other) | (other, Value::Bool(flag)) => loose_eq(&Value::from(u8::from(*flag)), other),
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            let (x, y) = (to_number(a), to_number(b));
            !x.is_nan() && x == y
        },
        (Value::Array(_) | Value::Object(_), primitive) | (primitive, Value::Array(_) | Value::Object(_)) => {
            let composite = if matches!(a, Value::Array(_) | Value::Object(_)) { a } else { b };
            loose_eq(&Value::String(to_string(composite)), primitive)
        },
    }
}

/// Strict equality: same type and same value. Numbers compare numerically so
/// that `1` and `1.0` are the same value.
pub(crate) fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Relational comparison. Two strings compare lexicographically, anything else
/// numerically; `None` when either side is not a number.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    let (a, b) = (primitive(a), primitive(b));
    if let (Value::String(x), Value::String(y)) = (&a, &b) {
        return Some(x.cmp(y));
    }
    to_number(&a).partial_cmp(&to_number(&b))
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub(crate) fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(flag) => f64::from(u8::from(*flag)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() { 0.0 } else { trimmed.parse().unwrap_or(f64::NAN) }
        },
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// String form used by `includes`, matching how a scripting runtime would
/// print the value.
pub(crate) fn to_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.as_f64().map(|f| f.to_string()).unwrap_or_default()
            }
        },
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| if item.is_null() { String::new() } else { to_string(item) })
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

fn primitive(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(to_string(value)),
        other => other.clone(),
    }
}
