//! Messages of the columnar read service

/// Serialization format requested for a read session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFormat {
    #[default]
    Arrow,
    Avro,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReadSessionRequest {
    /// Billing parent, `projects/{project}`.
    pub parent: String,
    /// Table resource name, see [`crate::TableReference::resource_name`].
    pub table: String,
    pub data_format: DataFormat,
    /// Zero lets the server pick.
    pub max_stream_count: i32,
    pub preferred_min_stream_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadStream {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadSession {
    pub name: String,
    pub streams: Vec<ReadStream>,
    /// IPC-serialized columnar schema, shared by every batch of the session.
    pub arrow_schema: Vec<u8>,
    pub estimated_row_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRowsRequest {
    pub read_stream: String,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadRowsResponse {
    pub row_count: i64,
    /// IPC-serialized record batch without the schema message.
    pub arrow_record_batch: Vec<u8>,
}
