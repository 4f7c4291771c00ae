//! Service seams for the remote job and read APIs
//!
//! The engine only talks to the remote system through these two traits.
//! Transport, authentication and request signing live in the implementors.

use async_trait::async_trait;
use futures::stream::BoxStream;

use bqread_types::{
    CreateReadSessionRequest, GetQueryResultsRequest, GetQueryResultsResponse, Job, JobReference,
    QueryRequest, QueryResponse, ReadRowsRequest, ReadRowsResponse, ReadSession, Table,
    TableReference,
};

use crate::error::RpcError;

pub type ReadRowsStream = BoxStream<'static, Result<ReadRowsResponse, RpcError>>;

#[async_trait]
pub trait JobService: Send + Sync {
    async fn insert_job(&self, project_id: &str, job: Job) -> Result<Job, RpcError>;

    async fn get_job(&self, job: &JobReference) -> Result<Job, RpcError>;

    async fn get_query_results(
        &self,
        request: GetQueryResultsRequest,
    ) -> Result<GetQueryResultsResponse, RpcError>;

    async fn query(&self, project_id: &str, request: QueryRequest)
        -> Result<QueryResponse, RpcError>;

    async fn get_table(&self, table: &TableReference) -> Result<Table, RpcError>;
}

#[async_trait]
pub trait ReadService: Send + Sync {
    async fn create_read_session(
        &self,
        request: CreateReadSessionRequest,
    ) -> Result<ReadSession, RpcError>;

    /// Open a server stream of record batches starting at `request.offset`.
    async fn read_rows(&self, request: ReadRowsRequest) -> Result<ReadRowsStream, RpcError>;
}
