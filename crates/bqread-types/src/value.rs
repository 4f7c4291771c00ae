//! Canonical row/value model

use serde_json::{Map, Number};
use std::fmt;
use thiserror::Error;

use crate::schema::SchemaView;

/// A decoded cell.
///
/// Temporal, decimal and bytes values hold their canonical text form (see
/// [`crate::canonical`]), so values produced by different decode paths
/// compare equal whenever they denote the same logical value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Numeric(String),
    BigNumeric(String),
    String(String),
    /// Standard base64 with padding.
    Bytes(String),
    Date(String),
    Time(String),
    DateTime(String),
    Timestamp(String),
    Json(String),
    Geography(String),
    Record(Row),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(f) => Some(*f),
            _ => None,
        }
    }

    /// Text of any string-backed scalar.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Numeric(s)
            | Value::BigNumeric(s)
            | Value::String(s)
            | Value::Bytes(s)
            | Value::Date(s)
            | Value::Time(s)
            | Value::DateTime(s)
            | Value::Timestamp(s)
            | Value::Json(s)
            | Value::Geography(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Row> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int64(_) => "INTEGER",
            Value::Float64(_) => "FLOAT",
            Value::Numeric(_) => "NUMERIC",
            Value::BigNumeric(_) => "BIGNUMERIC",
            Value::String(_) => "STRING",
            Value::Bytes(_) => "BYTES",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::DateTime(_) => "DATETIME",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Json(_) => "JSON",
            Value::Geography(_) => "GEOGRAPHY",
            Value::Record(_) => "RECORD",
            Value::Array(_) => "ARRAY",
        }
    }

    /// Plain JSON form: nested rows become objects, repeated values arrays.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int64(i) => serde_json::Value::from(*i),
            // JSON has no NaN/Infinity; fall back to the display form
            Value::Float64(f) => Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(self.to_string())),
            Value::Record(row) => serde_json::Value::Object(row.as_map()),
            Value::Array(values) => {
                serde_json::Value::Array(values.iter().map(Value::to_json).collect())
            }
            other => match other.as_str() {
                Some(s) => serde_json::Value::String(s.to_string()),
                None => serde_json::Value::Null,
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::Numeric(a), Value::Numeric(b))
            | (Value::BigNumeric(a), Value::BigNumeric(b))
            | (Value::String(a), Value::String(b))
            | (Value::Bytes(a), Value::Bytes(b))
            | (Value::Date(a), Value::Date(b))
            | (Value::Time(a), Value::Time(b))
            | (Value::DateTime(a), Value::DateTime(b))
            | (Value::Timestamp(a), Value::Timestamp(b))
            | (Value::Json(a), Value::Json(b))
            | (Value::Geography(a), Value::Geography(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Float64(v) if v.is_nan() => f.write_str("NaN"),
            Value::Float64(v) if v.is_infinite() => {
                f.write_str(if *v > 0.0 { "Infinity" } else { "-Infinity" })
            }
            Value::Float64(v) => write!(f, "{}", v),
            Value::Record(row) => write!(f, "{}", serde_json::Value::Object(row.as_map())),
            Value::Array(_) => write!(f, "{}", self.to_json()),
            other => f.write_str(other.as_str().unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row has {got} values but schema has {expected} fields")]
pub struct ShapeError {
    pub expected: usize,
    pub got: usize,
}

/// Schema-bound record. Values are stored in schema order.
#[derive(Clone)]
pub struct Row {
    schema: SchemaView,
    values: Vec<Value>,
}

impl Row {
    pub fn new(schema: SchemaView, values: Vec<Value>) -> Result<Self, ShapeError> {
        if schema.len() != values.len() {
            return Err(ShapeError {
                expected: schema.len(),
                got: values.len(),
            });
        }
        Ok(Self { schema, values })
    }

    pub fn schema(&self) -> &SchemaView {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.schema.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// `(column name, value)` pairs in schema order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema.names().zip(self.values.iter())
    }

    pub fn as_map(&self) -> Map<String, serde_json::Value> {
        self.iter()
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect()
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values && self.schema.names().eq(other.schema.names())
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSchema, FieldType};
    use serde_json::json;

    fn object_schema() -> SchemaView {
        SchemaView::from_fields(vec![
            FieldSchema::new("a", FieldType::String),
            FieldSchema::new("b", FieldType::String),
        ])
    }

    #[test]
    fn test_row_shape_is_checked() {
        let err = Row::new(object_schema(), vec![Value::Null]).unwrap_err();
        assert_eq!(err, ShapeError { expected: 2, got: 1 });
    }

    #[test]
    fn test_row_lookup() {
        let row = Row::new(
            object_schema(),
            vec![Value::String("1".into()), Value::Null],
        )
        .unwrap();

        assert_eq!(row.get(0), Some(&Value::String("1".into())));
        assert_eq!(row.get_by_name("b"), Some(&Value::Null));
        assert!(row.get_by_name("c").is_none());
        assert_eq!(row.iter().map(|(n, _)| n).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_as_map_nested() {
        let inner = Row::new(
            object_schema(),
            vec![Value::String("1".into()), Value::String("2".into())],
        )
        .unwrap();
        let outer = Row::new(
            SchemaView::from_fields(vec![
                FieldSchema::new("age", FieldType::Integer),
                FieldSchema::record("obj", vec![]).repeated(),
            ]),
            vec![Value::Int64(40), Value::Array(vec![Value::Record(inner)])],
        )
        .unwrap();

        assert_eq!(
            serde_json::Value::Object(outer.as_map()),
            json!({"age": 40, "obj": [{"a": "1", "b": "2"}]})
        );
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Float64(f64::NAN), Value::Float64(f64::NAN));
        assert_ne!(Value::Float64(0.0), Value::Float64(-0.0));
        assert_ne!(Value::Int64(1), Value::Float64(1.0));
    }

    #[test]
    fn test_display_matches_canonical_text() {
        assert_eq!(Value::Int64(40).to_string(), "40");
        assert_eq!(Value::Float64(f64::INFINITY).to_string(), "Infinity");
        assert_eq!(Value::Date("2016-03-20".into()).to_string(), "2016-03-20");
        assert_eq!(Value::Float64(f64::NAN).to_json(), json!("NaN"));
    }
}
