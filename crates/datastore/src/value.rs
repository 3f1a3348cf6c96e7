//! Comparable filter values and the comparison rules used when a filter is
//! evaluated in-process.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};

/// A runtime value a filter can compare against.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Wildcard when used as a filter value.
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Time(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Maps a JSON value onto a comparable one. Strings stay strings, even
    /// when they look like times; arrays and objects map to `Null`.
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    n.as_f64().map_or(Value::Null, Value::Float)
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            _ => Value::Null,
        }
    }

    /// Exact integer view; unsigned values above `i64::MAX` have none.
    fn as_i64_strict(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::UInt(u) => write!(f, "{u}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Time(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::UInt(u)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Time(t)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Filter comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Operator {
    /// Parses an operator, ignoring surrounding whitespace.
    pub fn parse(s: &str) -> StoreResult<Self> {
        match s.trim() {
            "=" => Ok(Operator::Eq),
            "<" => Ok(Operator::Lt),
            ">" => Ok(Operator::Gt),
            "<=" => Ok(Operator::Le),
            ">=" => Ok(Operator::Ge),
            other => Err(StoreError::InvalidOperator(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
        }
    }

    /// Whether `lhs.cmp(rhs) == ord` satisfies this operator.
    pub fn accepts(&self, ord: Ordering) -> bool {
        match self {
            Operator::Eq => ord == Ordering::Equal,
            Operator::Lt => ord == Ordering::Less,
            Operator::Gt => ord == Ordering::Greater,
            Operator::Le => ord != Ordering::Greater,
            Operator::Ge => ord != Ordering::Less,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evaluates `field op value`.
///
/// Strings compare lexically and times chronologically. A string compared
/// with a time is read as RFC 3339 and never matches if it is not one.
/// Numbers compare
/// exactly when both convert to `i64`, otherwise through `f64`. Booleans
/// only support equality. Anything else, `Null` included, never matches.
pub fn compare(field: &Value, op: Operator, value: &Value) -> bool {
    match (field, value) {
        (Value::Str(a), Value::Str(b)) => op.accepts(a.cmp(b)),
        (Value::Time(a), Value::Time(b)) => op.accepts(a.cmp(b)),
        (Value::Str(a), Value::Time(b)) => parse_time(a).is_some_and(|a| op.accepts(a.cmp(b))),
        (Value::Time(a), Value::Str(b)) => parse_time(b).is_some_and(|b| op.accepts(a.cmp(&b))),
        (Value::Bool(a), Value::Bool(b)) => op == Operator::Eq && a == b,
        _ => {
            if let (Some(a), Some(b)) = (field.as_i64_strict(), value.as_i64_strict()) {
                return op.accepts(a.cmp(&b));
            }
            match (field.as_f64(), value.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b).is_some_and(|ord| op.accepts(ord)),
                _ => false,
            }
        }
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}
