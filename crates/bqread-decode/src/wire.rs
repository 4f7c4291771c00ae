//! Paged document rows
//!
//! Each row arrives as `{"f": [{"v": cell}, ...]}`. Scalars are strings,
//! repeated fields are lists of `{"v": ...}` wrappers and records nest
//! another `{"f": [...]}` object.

use bqread_types::{canonicalize, FieldSchema, FieldType, Row, Scalar, SchemaView, Value};
use serde_json::Value as Json;

use crate::{check_supported, DecodeError, RowDecoder};

#[derive(Debug, Clone)]
pub struct WireDecoder {
    schema: SchemaView,
    use_int64_timestamp: bool,
}

impl WireDecoder {
    pub fn new(schema: SchemaView) -> Self {
        Self {
            schema,
            use_int64_timestamp: false,
        }
    }

    /// Timestamps arrive as integer microseconds instead of float seconds.
    pub fn with_int64_timestamp(mut self, enabled: bool) -> Self {
        self.use_int64_timestamp = enabled;
        self
    }

    pub fn decode_row(&self, index: usize, row: &Json) -> Result<Row, DecodeError> {
        self.record(index, &self.schema, row)
    }

    fn record(&self, index: usize, schema: &SchemaView, row: &Json) -> Result<Row, DecodeError> {
        let cells = row
            .get("f")
            .and_then(Json::as_array)
            .ok_or_else(|| DecodeError::FieldCount {
                row: index,
                expected: schema.len(),
                got: 0,
            })?;
        if cells.len() != schema.len() {
            return Err(DecodeError::FieldCount {
                row: index,
                expected: schema.len(),
                got: cells.len(),
            });
        }

        let mut values = Vec::with_capacity(cells.len());
        for (i, (field, cell)) in schema.fields().iter().zip(cells).enumerate() {
            let v = cell.get("v").ok_or_else(|| DecodeError::MissingValue {
                row: index,
                column: field.name.clone(),
            })?;
            values.push(self.field_value(index, field, schema.child(i), v)?);
        }

        Row::new(schema.clone(), values).map_err(|e| DecodeError::SchemaMismatch(e.to_string()))
    }

    fn field_value(
        &self,
        index: usize,
        field: &FieldSchema,
        child: Option<&SchemaView>,
        v: &Json,
    ) -> Result<Value, DecodeError> {
        check_supported(index, field)?;

        if !field.is_repeated() {
            return self.element(index, field, child, v);
        }

        let items = match v {
            Json::Null => return Ok(Value::Array(Vec::new())),
            Json::Array(items) => items,
            other => return Err(DecodeError::unexpected(index, field, describe(other))),
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let inner = item.get("v").ok_or_else(|| DecodeError::MissingValue {
                row: index,
                column: field.name.clone(),
            })?;
            out.push(self.element(index, field, child, inner)?);
        }
        Ok(Value::Array(out))
    }

    fn element(
        &self,
        index: usize,
        field: &FieldSchema,
        child: Option<&SchemaView>,
        v: &Json,
    ) -> Result<Value, DecodeError> {
        if v.is_null() {
            return Ok(Value::Null);
        }

        if field.field_type == FieldType::Record {
            let schema = child.ok_or_else(|| {
                DecodeError::SchemaMismatch(format!("record {} has no sub-schema", field.name))
            })?;
            return Ok(Value::Record(self.record(index, schema, v)?));
        }

        let text = v
            .as_str()
            .ok_or_else(|| DecodeError::unexpected(index, field, describe(v)))?;

        let scalar = if field.field_type == FieldType::Timestamp && self.use_int64_timestamp {
            let micros = text
                .parse::<i64>()
                .map_err(|_| DecodeError::unexpected(index, field, format!("timestamp {:?}", text)))?;
            Scalar::TimestampMicros(micros)
        } else {
            Scalar::Text(text)
        };

        canonicalize(field.field_type, scalar).map_err(|e| DecodeError::canonical(index, field, e))
    }
}

impl RowDecoder for WireDecoder {
    type Input = [Json];

    fn schema(&self) -> &SchemaView {
        &self.schema
    }

    fn decode(&self, rows: &[Json]) -> Result<Vec<Row>, DecodeError> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| self.decode_row(i, row))
            .collect()
    }
}

fn describe(v: &Json) -> String {
    match v {
        Json::Null => "null".into(),
        Json::Bool(_) => "bool".into(),
        Json::Number(n) => format!("number {}", n),
        Json::String(_) => "string".into(),
        Json::Array(_) => "list".into(),
        Json::Object(_) => "object".into(),
    }
}
