//! Table schema model
//!
//! [`SchemaView`] is the immutable, shareable form of a remote table schema.
//! Field order is authoritative for positional access; the name index is
//! secondary. The columnar (arrow) type mapping is derived on first use.

use arrow::datatypes::{DataType, Field, Fields, IntervalUnit, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::int_repr;

/// Column type tag. Legacy and standard SQL spellings both deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "STRING")]
    String,
    #[serde(rename = "BYTES")]
    Bytes,
    #[serde(rename = "INTEGER", alias = "INT64")]
    Integer,
    #[serde(rename = "FLOAT", alias = "FLOAT64")]
    Float,
    #[serde(rename = "BOOLEAN", alias = "BOOL")]
    Boolean,
    #[serde(rename = "TIMESTAMP")]
    Timestamp,
    #[serde(rename = "DATE")]
    Date,
    #[serde(rename = "TIME")]
    Time,
    #[serde(rename = "DATETIME")]
    DateTime,
    #[serde(rename = "NUMERIC", alias = "DECIMAL")]
    Numeric,
    #[serde(rename = "BIGNUMERIC", alias = "BIGDECIMAL")]
    BigNumeric,
    #[serde(rename = "GEOGRAPHY")]
    Geography,
    #[serde(rename = "JSON")]
    Json,
    #[serde(rename = "RECORD", alias = "STRUCT")]
    Record,
    #[serde(rename = "RANGE")]
    Range,
    #[serde(rename = "INTERVAL")]
    Interval,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Bytes => "BYTES",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::DateTime => "DATETIME",
            FieldType::Numeric => "NUMERIC",
            FieldType::BigNumeric => "BIGNUMERIC",
            FieldType::Geography => "GEOGRAPHY",
            FieldType::Json => "JSON",
            FieldType::Record => "RECORD",
            FieldType::Range => "RANGE",
            FieldType::Interval => "INTERVAL",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FieldMode {
    #[default]
    #[serde(rename = "NULLABLE")]
    Nullable,
    #[serde(rename = "REQUIRED")]
    Required,
    #[serde(rename = "REPEATED")]
    Repeated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeElementType {
    #[serde(rename = "type")]
    pub element_type: FieldType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
    #[serde(
        default,
        deserialize_with = "int_repr::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub precision: Option<u32>,
    #[serde(
        default,
        deserialize_with = "int_repr::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub scale: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_element_type: Option<RangeElementType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
            fields: Vec::new(),
            precision: None,
            scale: None,
            range_element_type: None,
            description: None,
        }
    }

    pub fn record(name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self {
            fields,
            ..Self::new(name, FieldType::Record)
        }
    }

    pub fn with_mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn repeated(self) -> Self {
        self.with_mode(FieldMode::Repeated)
    }

    pub fn required(self) -> Self {
        self.with_mode(FieldMode::Required)
    }

    pub fn is_repeated(&self) -> bool {
        self.mode == FieldMode::Repeated
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Immutable, cheaply cloneable view over a table schema.
#[derive(Clone)]
pub struct SchemaView {
    inner: Arc<ViewInner>,
}

struct ViewInner {
    fields: Vec<FieldSchema>,
    index: HashMap<String, usize>,
    /// Scoped views for RECORD fields, by position.
    children: Vec<Option<SchemaView>>,
    columnar: OnceLock<SchemaRef>,
}

impl SchemaView {
    pub fn new(schema: TableSchema) -> Self {
        Self::from_fields(schema.fields)
    }

    pub fn from_fields(fields: Vec<FieldSchema>) -> Self {
        let index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        let children = fields
            .iter()
            .map(|f| match f.field_type {
                FieldType::Record => Some(SchemaView::from_fields(f.fields.clone())),
                _ => None,
            })
            .collect();

        Self {
            inner: Arc::new(ViewInner {
                fields,
                index,
                children,
                columnar: OnceLock::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.fields.is_empty()
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.inner.fields
    }

    pub fn field(&self, index: usize) -> Option<&FieldSchema> {
        self.inner.fields.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.inner.index.get(name).copied()
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldSchema> {
        self.index_of(name).and_then(|i| self.field(i))
    }

    /// View scoped to the nested fields of the RECORD at `index`.
    pub fn child(&self, index: usize) -> Option<&SchemaView> {
        self.inner.children.get(index).and_then(Option::as_ref)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.fields.iter().map(|f| f.name.as_str())
    }

    pub fn to_table_schema(&self) -> TableSchema {
        TableSchema::new(self.inner.fields.clone())
    }

    /// Columnar schema this table is expected to arrive in, computed once.
    pub fn columnar_schema(&self) -> SchemaRef {
        self.inner
            .columnar
            .get_or_init(|| {
                let fields: Vec<Field> = self.inner.fields.iter().map(columnar_field).collect();
                Arc::new(Schema::new(fields))
            })
            .clone()
    }
}

impl fmt::Debug for SchemaView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaView")
            .field("fields", &self.inner.fields)
            .finish()
    }
}

impl PartialEq for SchemaView {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.fields == other.inner.fields
    }
}

impl From<TableSchema> for SchemaView {
    fn from(schema: TableSchema) -> Self {
        SchemaView::new(schema)
    }
}

pub fn columnar_field(field: &FieldSchema) -> Field {
    Field::new(
        field.name.clone(),
        columnar_type(field),
        field.mode != FieldMode::Required,
    )
}

/// Columnar type for a field, wrapped in a list when the field is repeated.
pub fn columnar_type(field: &FieldSchema) -> DataType {
    let element = columnar_element_type(field.field_type, field);
    if field.is_repeated() {
        DataType::List(Arc::new(Field::new("item", element, false)))
    } else {
        element
    }
}

fn columnar_element_type(field_type: FieldType, field: &FieldSchema) -> DataType {
    match field_type {
        FieldType::String | FieldType::Json | FieldType::Geography => DataType::Utf8,
        FieldType::Bytes => DataType::Binary,
        FieldType::Integer => DataType::Int64,
        FieldType::Float => DataType::Float64,
        FieldType::Boolean => DataType::Boolean,
        FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        FieldType::Date => DataType::Date32,
        FieldType::Time => DataType::Time64(TimeUnit::Microsecond),
        FieldType::DateTime => DataType::Timestamp(TimeUnit::Microsecond, None),
        FieldType::Numeric => DataType::Decimal128(38, 9),
        FieldType::BigNumeric => DataType::Decimal256(76, 38),
        FieldType::Interval => DataType::Interval(IntervalUnit::MonthDayNano),
        FieldType::Range => {
            let element = field
                .range_element_type
                .map(|r| r.element_type)
                .unwrap_or(FieldType::Timestamp);
            let bound = columnar_element_type(element, field);
            DataType::Struct(Fields::from(vec![
                Field::new("start", bound.clone(), true),
                Field::new("end", bound, true),
            ]))
        }
        FieldType::Record => {
            let children: Vec<Field> = field.fields.iter().map(columnar_field).collect();
            DataType::Struct(Fields::from(children))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_schema() -> TableSchema {
        TableSchema::new(vec![
            FieldSchema::new("age", FieldType::Integer),
            FieldSchema::record(
                "nested",
                vec![FieldSchema::record(
                    "object",
                    vec![
                        FieldSchema::new("a", FieldType::String),
                        FieldSchema::new("b", FieldType::String),
                    ],
                )],
            )
            .repeated(),
        ])
    }

    #[test]
    fn test_schema_from_rest_json() {
        let json = r#"{"fields": [
            {"name": "id", "type": "INT64", "mode": "REQUIRED"},
            {"name": "price", "type": "NUMERIC", "precision": "10", "scale": "2"},
            {"name": "tags", "type": "STRING", "mode": "REPEATED"},
            {"name": "meta", "type": "STRUCT", "fields": [{"name": "ok", "type": "BOOL"}]}
        ]}"#;
        let schema: TableSchema = serde_json::from_str(json).unwrap();

        assert_eq!(schema.fields[0].field_type, FieldType::Integer);
        assert_eq!(schema.fields[0].mode, FieldMode::Required);
        assert_eq!(schema.fields[1].precision, Some(10));
        assert_eq!(schema.fields[1].scale, Some(2));
        assert!(schema.fields[2].is_repeated());
        assert_eq!(schema.fields[3].field_type, FieldType::Record);
        assert_eq!(schema.fields[3].fields[0].field_type, FieldType::Boolean);
    }

    #[test]
    fn test_positional_and_name_lookup() {
        let view = SchemaView::new(nested_schema());
        assert_eq!(view.len(), 2);
        assert_eq!(view.index_of("nested"), Some(1));
        assert_eq!(view.field(0).unwrap().name, "age");
        assert!(view.index_of("missing").is_none());

        let nested = view.child(1).unwrap();
        assert_eq!(nested.names().collect::<Vec<_>>(), vec!["object"]);
        assert_eq!(nested.child(0).unwrap().len(), 2);
        assert!(view.child(0).is_none());
    }

    #[test]
    fn test_columnar_mapping() {
        let view = SchemaView::new(nested_schema());
        let schema = view.columnar_schema();

        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        match schema.field(1).data_type() {
            DataType::List(item) => match item.data_type() {
                DataType::Struct(children) => {
                    assert_eq!(children.len(), 1);
                    assert_eq!(children[0].name(), "object");
                }
                other => panic!("expected struct element, got {:?}", other),
            },
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_columnar_mapping_is_cached() {
        let view = SchemaView::new(nested_schema());
        let first = view.columnar_schema();
        let second = view.clone().columnar_schema();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_temporal_and_decimal_mapping() {
        let ts = FieldSchema::new("ts", FieldType::Timestamp);
        let dt = FieldSchema::new("dt", FieldType::DateTime);
        let num = FieldSchema::new("n", FieldType::Numeric);
        let big = FieldSchema::new("b", FieldType::BigNumeric);

        assert_eq!(
            columnar_type(&ts),
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
        assert_eq!(columnar_type(&dt), DataType::Timestamp(TimeUnit::Microsecond, None));
        assert_eq!(columnar_type(&num), DataType::Decimal128(38, 9));
        assert_eq!(columnar_type(&big), DataType::Decimal256(76, 38));
    }
}
