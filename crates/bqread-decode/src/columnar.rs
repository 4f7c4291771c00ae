//! Columnar record batches from the read service
//!
//! A read session publishes its IPC schema message once; every response
//! afterwards carries only a record batch message. The decoder glues the two
//! back into a stream before handing it to the IPC reader.

use std::io::Cursor;

use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Date32Type, Date64Type, Decimal128Type, Decimal256Type, Float16Type, Float32Type,
    Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, Schema, Time32MillisecondType,
    Time32SecondType, Time64MicrosecondType, Time64NanosecondType, TimeUnit,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt8Type,
};
use arrow::error::ArrowError;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use bqread_types::{canonicalize, FieldSchema, FieldType, Row, Scalar, SchemaView, Value};
use tracing::debug;

use crate::{check_supported, DecodeError, RowDecoder};

/// Continuation marker plus zero length.
const EOS_LEN: usize = 8;

const MILLIS_PER_DAY: i64 = 86_400_000;

#[derive(Debug, Clone)]
pub struct ColumnarDecoder {
    schema: SchemaView,
    serialized_schema: Vec<u8>,
}

impl ColumnarDecoder {
    /// Bind a session's serialized schema message to the table schema.
    ///
    /// Fails when the message cannot be read or its column count differs
    /// from the table schema.
    pub fn new(serialized_schema: Vec<u8>, schema: SchemaView) -> Result<Self, DecodeError> {
        let columns = {
            let reader = StreamReader::try_new(Cursor::new(serialized_schema.as_slice()), None)?;
            reader.schema().fields().len()
        };
        if columns != schema.len() {
            return Err(DecodeError::SchemaMismatch(format!(
                "session schema has {} columns, table schema has {}",
                columns,
                schema.len()
            )));
        }

        Ok(Self {
            schema,
            serialized_schema,
        })
    }

    pub fn serialized_schema(&self) -> &[u8] {
        &self.serialized_schema
    }

    /// Decode one serialized record batch message.
    pub fn decode_batch(&self, batch: &[u8]) -> Result<Vec<Row>, DecodeError> {
        self.decode_batch_at(batch, 0)
    }

    /// Like [`decode_batch`](Self::decode_batch), numbering rows in errors
    /// from `first_row`, the batch's position in its stream.
    pub fn decode_batch_at(&self, batch: &[u8], first_row: usize) -> Result<Vec<Row>, DecodeError> {
        let mut rows = Vec::new();
        for record_batch in self.read_record_batches(batch)? {
            let offset = first_row + rows.len();
            rows.extend(self.decode_record_batch_from(&record_batch, offset)?);
        }

        debug!(rows = rows.len(), bytes = batch.len(), first_row, "Decoded record batch");
        Ok(rows)
    }

    /// Undecoded Arrow batches of one serialized record batch message.
    pub fn read_record_batches(&self, batch: &[u8]) -> Result<Vec<RecordBatch>, DecodeError> {
        let mut buf = Vec::with_capacity(self.serialized_schema.len() + batch.len());
        buf.extend_from_slice(&self.serialized_schema);
        buf.extend_from_slice(batch);

        let reader = StreamReader::try_new(Cursor::new(buf), None)?;
        let batches = reader.collect::<Result<Vec<_>, ArrowError>>()?;
        Ok(batches)
    }

    pub fn decode_record_batch(&self, batch: &RecordBatch) -> Result<Vec<Row>, DecodeError> {
        self.decode_record_batch_from(batch, 0)
    }

    fn decode_record_batch_from(
        &self,
        batch: &RecordBatch,
        first_row: usize,
    ) -> Result<Vec<Row>, DecodeError> {
        if batch.num_columns() != self.schema.len() {
            return Err(DecodeError::SchemaMismatch(format!(
                "batch has {} columns, table schema has {}",
                batch.num_columns(),
                self.schema.len()
            )));
        }

        let mut rows = Vec::with_capacity(batch.num_rows());
        for i in 0..batch.num_rows() {
            let row = first_row + i;
            let mut values = Vec::with_capacity(self.schema.len());
            for (j, field) in self.schema.fields().iter().enumerate() {
                let array = batch.column(j);
                values.push(column_value(row, field, self.schema.child(j), array.as_ref(), i)?);
            }
            rows.push(
                Row::new(self.schema.clone(), values)
                    .map_err(|e| DecodeError::SchemaMismatch(e.to_string()))?,
            );
        }
        Ok(rows)
    }
}

impl RowDecoder for ColumnarDecoder {
    type Input = [u8];

    fn schema(&self) -> &SchemaView {
        &self.schema
    }

    fn decode(&self, batch: &[u8]) -> Result<Vec<Row>, DecodeError> {
        self.decode_batch(batch)
    }
}

fn column_value(
    row: usize,
    field: &FieldSchema,
    child: Option<&SchemaView>,
    array: &dyn Array,
    i: usize,
) -> Result<Value, DecodeError> {
    check_supported(row, field)?;

    if !field.is_repeated() {
        return element(row, field, child, array, i);
    }
    if array.is_null(i) {
        return Ok(Value::Array(Vec::new()));
    }

    let items = match array.data_type() {
        DataType::List(_) => array.as_list::<i32>().value(i),
        DataType::LargeList(_) => array.as_list::<i64>().value(i),
        other => {
            return Err(DecodeError::unexpected(
                row,
                field,
                format!("{} for repeated field", other),
            ))
        }
    };
    (0..items.len())
        .map(|j| element(row, field, child, items.as_ref(), j))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn element(
    row: usize,
    field: &FieldSchema,
    child: Option<&SchemaView>,
    array: &dyn Array,
    i: usize,
) -> Result<Value, DecodeError> {
    if array.is_null(i) {
        return Ok(Value::Null);
    }

    if field.field_type == FieldType::Record {
        return record(row, field, child, array, i);
    }

    let ft = field.field_type;
    let result = match array.data_type() {
        DataType::Boolean => canonicalize(ft, Scalar::Bool(array.as_boolean().value(i))),

        DataType::Int8 => canonicalize(ft, Scalar::Int(array.as_primitive::<Int8Type>().value(i).into())),
        DataType::Int16 => canonicalize(ft, Scalar::Int(array.as_primitive::<Int16Type>().value(i).into())),
        DataType::Int32 => canonicalize(ft, Scalar::Int(array.as_primitive::<Int32Type>().value(i).into())),
        DataType::Int64 => canonicalize(ft, Scalar::Int(array.as_primitive::<Int64Type>().value(i))),
        DataType::UInt8 => canonicalize(ft, Scalar::Int(array.as_primitive::<UInt8Type>().value(i).into())),
        DataType::UInt16 => canonicalize(ft, Scalar::Int(array.as_primitive::<UInt16Type>().value(i).into())),
        DataType::UInt32 => canonicalize(ft, Scalar::Int(array.as_primitive::<UInt32Type>().value(i).into())),

        DataType::Float16 => {
            canonicalize(ft, Scalar::Float(array.as_primitive::<Float16Type>().value(i).to_f64()))
        }
        DataType::Float32 => {
            // widen through the shortest text form so 1.3f32 stays 1.3
            let v = array.as_primitive::<Float32Type>().value(i);
            let widened = v.to_string().parse::<f64>().unwrap_or(f64::from(v));
            canonicalize(ft, Scalar::Float(widened))
        }
        DataType::Float64 => canonicalize(ft, Scalar::Float(array.as_primitive::<Float64Type>().value(i))),

        DataType::Utf8 => canonicalize(ft, Scalar::Text(array.as_string::<i32>().value(i))),
        DataType::LargeUtf8 => canonicalize(ft, Scalar::Text(array.as_string::<i64>().value(i))),
        DataType::Binary => canonicalize(ft, Scalar::Bytes(array.as_binary::<i32>().value(i))),
        DataType::LargeBinary => canonicalize(ft, Scalar::Bytes(array.as_binary::<i64>().value(i))),

        DataType::Date32 => canonicalize(ft, Scalar::DateDays(array.as_primitive::<Date32Type>().value(i))),
        DataType::Date64 => {
            let ms = array.as_primitive::<Date64Type>().value(i);
            let days = i32::try_from(ms.div_euclid(MILLIS_PER_DAY))
                .map_err(|_| DecodeError::unexpected(row, field, format!("date64 {}", ms)))?;
            canonicalize(ft, Scalar::DateDays(days))
        }

        DataType::Time32(unit) => {
            let micros = match unit {
                TimeUnit::Second => i64::from(array.as_primitive::<Time32SecondType>().value(i)) * 1_000_000,
                _ => i64::from(array.as_primitive::<Time32MillisecondType>().value(i)) * 1_000,
            };
            canonicalize(ft, Scalar::TimeMicros(micros))
        }
        DataType::Time64(unit) => {
            let micros = match unit {
                TimeUnit::Nanosecond => array.as_primitive::<Time64NanosecondType>().value(i) / 1_000,
                _ => array.as_primitive::<Time64MicrosecondType>().value(i),
            };
            canonicalize(ft, Scalar::TimeMicros(micros))
        }

        DataType::Timestamp(unit, zone) => {
            let micros = match unit {
                TimeUnit::Second => array
                    .as_primitive::<TimestampSecondType>()
                    .value(i)
                    .saturating_mul(1_000_000),
                TimeUnit::Millisecond => array
                    .as_primitive::<TimestampMillisecondType>()
                    .value(i)
                    .saturating_mul(1_000),
                TimeUnit::Microsecond => array.as_primitive::<TimestampMicrosecondType>().value(i),
                TimeUnit::Nanosecond => array
                    .as_primitive::<TimestampNanosecondType>()
                    .value(i)
                    .div_euclid(1_000),
            };
            // zoneless timestamps are wall-clock DATETIME values
            match zone {
                None => canonicalize(ft, Scalar::DateTimeMicros(micros)),
                Some(_) => canonicalize(ft, Scalar::TimestampMicros(micros)),
            }
        }

        DataType::Decimal128(_, _) => {
            let text = array.as_primitive::<Decimal128Type>().value_as_string(i);
            canonicalize(ft, Scalar::Decimal(&text))
        }
        DataType::Decimal256(_, _) => {
            let text = array.as_primitive::<Decimal256Type>().value_as_string(i);
            canonicalize(ft, Scalar::Decimal(&text))
        }

        other => return Err(DecodeError::unexpected(row, field, other.to_string())),
    };

    result.map_err(|e| DecodeError::canonical(row, field, e))
}

fn record(
    row: usize,
    field: &FieldSchema,
    child: Option<&SchemaView>,
    array: &dyn Array,
    i: usize,
) -> Result<Value, DecodeError> {
    let schema = child.ok_or_else(|| {
        DecodeError::SchemaMismatch(format!("record {} has no sub-schema", field.name))
    })?;
    let columns = array
        .as_struct_opt()
        .ok_or_else(|| DecodeError::unexpected(row, field, array.data_type().to_string()))?;
    if columns.num_columns() != schema.len() {
        return Err(DecodeError::SchemaMismatch(format!(
            "record {} has {} columns, schema has {}",
            field.name,
            columns.num_columns(),
            schema.len()
        )));
    }

    let mut values = Vec::with_capacity(schema.len());
    for (j, nested) in schema.fields().iter().enumerate() {
        values.push(column_value(
            row,
            nested,
            schema.child(j),
            columns.column(j).as_ref(),
            i,
        )?);
    }
    Row::new(schema.clone(), values)
        .map(Value::Record)
        .map_err(|e| DecodeError::SchemaMismatch(e.to_string()))
}

/// Serialize batches the way a read session delivers them: one schema
/// message, then one record batch message per batch.
pub fn encode_ipc_payload(
    schema: &Schema,
    batches: &[RecordBatch],
) -> Result<(Vec<u8>, Vec<Vec<u8>>), DecodeError> {
    let header = write_stream(schema, None)?;
    let schema_len = header.len().saturating_sub(EOS_LEN);

    let mut messages = Vec::with_capacity(batches.len());
    for batch in batches {
        let stream = write_stream(schema, Some(batch))?;
        let end = stream.len().saturating_sub(EOS_LEN);
        let message = stream
            .get(schema_len..end)
            .ok_or_else(|| DecodeError::Ipc("record batch message is empty".into()))?;
        messages.push(message.to_vec());
    }

    Ok((header[..schema_len].to_vec(), messages))
}

fn write_stream(schema: &Schema, batch: Option<&RecordBatch>) -> Result<Vec<u8>, ArrowError> {
    let mut writer = StreamWriter::try_new(Vec::new(), schema)?;
    if let Some(batch) = batch {
        writer.write(batch)?;
    }
    writer.finish()?;
    writer.into_inner()
}
