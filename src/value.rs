//! Dynamically-typed sensor value and the per-kind coercion rules
//! applied on every write.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value flowing through the graph: a wire-level reading, a sensor's
/// current state, or an expression result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => s.parse().ok(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(*n != 0.0),
            Value::Text(s) => Some(!s.is_empty()),
        }
    }
}

/// The sensor kind, deciding coercion and default-value initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Gauge,
    Counter,
    Binary,
    Message,
}

impl Default for Kind {
    fn default() -> Self {
        Kind::Gauge
    }
}

/// Strings accepted as `true` by the binary coercion table.
const TRUE_STRINGS: &[&str] = &["True", "true", "ON", "On", "on", "OK", "Yes", "yes", "1"];
/// Strings accepted as `false`.
const FALSE_STRINGS: &[&str] = &[
    "False", "false", "OFF", "Off", "off", "LOW", "No", "no", "0",
];

impl Kind {
    /// Coerce an incoming wire value to this sensor's kind. Returns
    /// `None` when coercion is impossible (e.g. a non-numeric string
    /// handed to a GAUGE); the caller treats that as a rejected write.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match self {
            Kind::Gauge | Kind::Counter => match value {
                Value::Number(n) => Some(Value::Number(*n)),
                Value::Bool(b) => Some(Value::Number(if *b { 1.0 } else { 0.0 })),
                Value::Text(s) => s.trim().parse::<f64>().ok().map(Value::Number),
            },
            Kind::Binary => match value {
                Value::Bool(b) => Some(Value::Bool(*b)),
                Value::Number(n) => Some(Value::Bool(*n != 0.0)),
                Value::Text(s) => {
                    if TRUE_STRINGS.contains(&s.as_str()) {
                        Some(Value::Bool(true))
                    } else if FALSE_STRINGS.contains(&s.as_str()) {
                        Some(Value::Bool(false))
                    } else {
                        Some(Value::Bool(!s.is_empty()))
                    }
                }
            },
            Kind::Message => Some(value.clone()),
        }
    }

    /// The kind-appropriate zero-ish default when config doesn't name one.
    pub fn implicit_default(&self) -> Option<Value> {
        match self {
            Kind::Gauge | Kind::Counter => None,
            Kind::Binary => Some(Value::Bool(false)),
            Kind::Message => Some(Value::Text(String::new())),
        }
    }
}
