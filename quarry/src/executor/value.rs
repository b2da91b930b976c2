//! Typed column values
//!
//! Store results are decoded once into [`ColumnValue`]; consumers never look
//! at raw JSON again. Integer and floating point values stay apart so running
//! sums and comparisons keep the source column's precision.

use serde_json::{Number, Value};
use std::cmp::Ordering;

/// A single decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    /// Nested values (arrays, tuples, maps) kept as JSON
    Json(Value),
}

impl ColumnValue {
    /// Decode a JSON value as returned by the store's JSON output formats
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => ColumnValue::Null,
            Value::Bool(b) => ColumnValue::Bool(b),
            Value::Number(n) => Self::from_number(&n),
            Value::String(s) => ColumnValue::String(s),
            other => ColumnValue::Json(other),
        }
    }

    fn from_number(n: &Number) -> Self {
        if let Some(i) = n.as_i64() {
            ColumnValue::Int(i)
        } else if let Some(u) = n.as_u64() {
            ColumnValue::UInt(u)
        } else {
            n.as_f64().map(ColumnValue::Float).unwrap_or(ColumnValue::Null)
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Numeric view of the value
    ///
    /// 64-bit integers arrive quoted from the store, so numeric-looking
    /// strings are accepted too.
    pub fn as_numeric(&self) -> Option<NumericValue> {
        match self {
            ColumnValue::Int(i) => Some(NumericValue::Int(*i)),
            ColumnValue::UInt(u) => Some(NumericValue::UInt(*u)),
            ColumnValue::Float(f) if f.is_finite() => Some(NumericValue::Float(*f)),
            ColumnValue::Bool(b) => Some(NumericValue::Int(i64::from(*b))),
            ColumnValue::String(s) => NumericValue::parse(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_numeric().map(|n| n.as_f64())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.as_numeric()? {
            NumericValue::Int(i) => Some(i),
            NumericValue::UInt(u) => i64::try_from(u).ok(),
            NumericValue::Float(f) => Some(f as i64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value as a bucket key string
    pub fn key_string(&self) -> String {
        match self {
            ColumnValue::Null => "null".to_string(),
            ColumnValue::Bool(b) => b.to_string(),
            ColumnValue::Int(i) => i.to_string(),
            ColumnValue::UInt(u) => u.to_string(),
            ColumnValue::Float(f) => f.to_string(),
            ColumnValue::String(s) => s.clone(),
            ColumnValue::Json(v) => v.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ColumnValue::Null => Value::Null,
            ColumnValue::Bool(b) => Value::Bool(*b),
            ColumnValue::Int(i) => Value::from(*i),
            ColumnValue::UInt(u) => Value::from(*u),
            ColumnValue::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ColumnValue::String(s) => Value::String(s.clone()),
            ColumnValue::Json(v) => v.clone(),
        }
    }
}

impl From<Value> for ColumnValue {
    fn from(value: Value) -> Self {
        ColumnValue::from_json(value)
    }
}

/// Numeric value that remembers whether it came from an integer column
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericValue {
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl NumericValue {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(i) = s.parse::<i64>() {
            return Some(NumericValue::Int(i));
        }
        if let Ok(u) = s.parse::<u64>() {
            return Some(NumericValue::UInt(u));
        }
        s.parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(NumericValue::Float)
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            NumericValue::Int(i) => *i as f64,
            NumericValue::UInt(u) => *u as f64,
            NumericValue::Float(f) => *f,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match self {
            NumericValue::Int(i) => Some(i128::from(*i)),
            NumericValue::UInt(u) => Some(i128::from(*u)),
            NumericValue::Float(_) => None,
        }
    }

    fn from_i128(v: i128) -> Self {
        if let Ok(i) = i64::try_from(v) {
            NumericValue::Int(i)
        } else if let Ok(u) = u64::try_from(v) {
            NumericValue::UInt(u)
        } else {
            NumericValue::Float(v as f64)
        }
    }

    /// Sum, staying on the integer path while both sides are integers
    pub fn add(self, other: Self) -> Self {
        match (self, other) {
            (NumericValue::UInt(a), NumericValue::UInt(b)) => a
                .checked_add(b)
                .map(NumericValue::UInt)
                .unwrap_or(NumericValue::Float(a as f64 + b as f64)),
            (a, b) => match (a.as_i128(), b.as_i128()) {
                (Some(x), Some(y)) => Self::from_i128(x + y),
                _ => NumericValue::Float(a.as_f64() + b.as_f64()),
            },
        }
    }

    /// Difference, integer inputs may go negative
    pub fn sub(self, other: Self) -> Self {
        match (self.as_i128(), other.as_i128()) {
            (Some(x), Some(y)) => Self::from_i128(x - y),
            _ => NumericValue::Float(self.as_f64() - other.as_f64()),
        }
    }

    /// Ordering that compares integers exactly
    pub fn compare(&self, other: &Self) -> Ordering {
        match (self.as_i128(), other.as_i128()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => self
                .as_f64()
                .partial_cmp(&other.as_f64())
                .unwrap_or(Ordering::Equal),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            NumericValue::Int(i) => Value::from(*i),
            NumericValue::UInt(u) => Value::from(*u),
            NumericValue::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_keeps_integer_kinds() {
        assert_eq!(ColumnValue::from_json(json!(5)), ColumnValue::Int(5));
        assert_eq!(
            ColumnValue::from_json(json!(u64::MAX)),
            ColumnValue::UInt(u64::MAX)
        );
        assert_eq!(ColumnValue::from_json(json!(1.5)), ColumnValue::Float(1.5));
        assert_eq!(ColumnValue::from_json(json!(null)), ColumnValue::Null);
        assert!(matches!(
            ColumnValue::from_json(json!([1, 2])),
            ColumnValue::Json(_)
        ));
    }

    #[test]
    fn test_quoted_integers_are_numeric() {
        let v = ColumnValue::from_json(json!("18446744073709551615"));
        assert_eq!(v.as_numeric(), Some(NumericValue::UInt(u64::MAX)));
        assert_eq!(
            ColumnValue::String("abc".into()).as_numeric(),
            None
        );
    }

    #[test]
    fn test_integer_sum_stays_exact() {
        let a = NumericValue::Int(282);
        let b = NumericValue::UInt(300);
        assert_eq!(a.add(b), NumericValue::Int(582));
        let big = NumericValue::UInt(u64::MAX).add(NumericValue::UInt(1));
        assert!(matches!(big, NumericValue::Float(_)));
    }

    #[test]
    fn test_sub_and_mixed_float() {
        assert_eq!(
            NumericValue::UInt(3).sub(NumericValue::UInt(5)),
            NumericValue::Int(-2)
        );
        assert_eq!(
            NumericValue::Int(3).add(NumericValue::Float(0.5)),
            NumericValue::Float(3.5)
        );
    }

    #[test]
    fn test_compare_large_integers_exactly() {
        let a = NumericValue::Int(9_007_199_254_740_993);
        let b = NumericValue::Int(9_007_199_254_740_992);
        assert_eq!(a.compare(&b), Ordering::Greater);
        assert_eq!(
            NumericValue::Float(1.0).compare(&NumericValue::Int(1)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_to_json_types() {
        assert_eq!(NumericValue::Int(3).to_json(), json!(3));
        assert_eq!(NumericValue::Float(3.0).to_json(), json!(3.0));
        assert_eq!(ColumnValue::Float(f64::NAN).to_json(), json!(null));
    }
}
