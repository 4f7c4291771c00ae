//! Row decoders for query results
//!
//! Two payload shapes carry result rows: the paged document form returned by
//! the job service and the columnar record batches returned by the read
//! service. Both decoders reduce each cell to a [`bqread_types::Scalar`] and
//! go through the same canonicalization, so a row decodes to the same
//! [`Row`] no matter which path delivered it.

mod columnar;
mod wire;

pub use columnar::{encode_ipc_payload, ColumnarDecoder};
pub use wire::WireDecoder;

use bqread_types::{CanonicalError, FieldSchema, FieldType, Row, SchemaView};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("row {row}: expected {expected} fields, got {got}")]
    FieldCount {
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("row {row}, column {column}: value is missing")]
    MissingValue { row: usize, column: String },

    #[error("row {row}, column {column}: unexpected {found}")]
    UnexpectedValue {
        row: usize,
        column: String,
        found: String,
    },

    #[error("row {row}, column {column}: {source}")]
    Canonical {
        row: usize,
        column: String,
        source: CanonicalError,
    },

    #[error("column {column}: {field_type} values are not supported")]
    Unsupported {
        column: String,
        field_type: FieldType,
    },

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
}

impl DecodeError {
    pub(crate) fn canonical(row: usize, field: &FieldSchema, source: CanonicalError) -> Self {
        match source {
            CanonicalError::Unsupported(field_type) => DecodeError::Unsupported {
                column: field.name.clone(),
                field_type,
            },
            source => DecodeError::Canonical {
                row,
                column: field.name.clone(),
                source,
            },
        }
    }

    pub(crate) fn unexpected(row: usize, field: &FieldSchema, found: impl Into<String>) -> Self {
        DecodeError::UnexpectedValue {
            row,
            column: field.name.clone(),
            found: found.into(),
        }
    }
}

impl From<arrow::error::ArrowError> for DecodeError {
    fn from(err: arrow::error::ArrowError) -> Self {
        DecodeError::Ipc(err.to_string())
    }
}

/// Turns one payload into schema-bound rows.
pub trait RowDecoder {
    type Input: ?Sized;

    fn schema(&self) -> &SchemaView;

    fn decode(&self, input: &Self::Input) -> Result<Vec<Row>, DecodeError>;
}

/// RANGE and INTERVAL have no canonical form yet; both decoders refuse them
/// before looking at the payload.
pub(crate) fn check_supported(row: usize, field: &FieldSchema) -> Result<(), DecodeError> {
    match field.field_type {
        FieldType::Range | FieldType::Interval => Err(DecodeError::canonical(
            row,
            field,
            CanonicalError::Unsupported(field.field_type),
        )),
        _ => Ok(()),
    }
}
