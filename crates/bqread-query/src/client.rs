//! Entry point for running queries and attaching to jobs

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use bqread_types::{DataFormatOptions, Job, JobReference, QueryRequest, TableReference};

use crate::config::ClientConfig;
use crate::error::QueryError;
use crate::handle::{QueryHandle, Services};
use crate::job::{JobController, JobStep, StepContext};
use crate::retry::RetryPolicy;
use crate::rpc::{JobService, ReadService};
use crate::source::{BatchIterator, RowIterator, StreamingSource};

#[derive(Clone)]
pub struct QueryClient {
    jobs: Arc<dyn JobService>,
    reader: Option<Arc<dyn ReadService>>,
    config: Arc<ClientConfig>,
}

impl QueryClient {
    pub fn new(jobs: Arc<dyn JobService>, config: ClientConfig) -> Self {
        Self {
            jobs,
            reader: None,
            config: Arc::new(config),
        }
    }

    /// Enable the parallel read-stream path for results.
    pub fn with_read_client(mut self, reader: Arc<dyn ReadService>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn project_id(&self) -> &str {
        &self.config.project_id
    }

    /// Synchronous query request for `sql` with the client's defaults.
    pub fn query_request(&self, sql: impl Into<String>) -> QueryRequest {
        QueryRequest {
            query: sql.into(),
            location: self.config.location.clone(),
            max_results: self.config.read.page_size,
            request_id: Some(Uuid::new_v4().to_string()),
            format_options: Some(DataFormatOptions {
                use_int64_timestamp: self.config.read.use_int64_timestamp,
            }),
            ..Default::default()
        }
    }

    /// Issue a synchronous query. The returned handle caches the inline
    /// first page, so small results need no further calls.
    pub async fn run_query(
        &self,
        mut request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryHandle, QueryError> {
        // fixed before the first attempt so every retry carries the same id
        if request.request_id.is_none() {
            request.request_id = Some(Uuid::new_v4().to_string());
        }

        let policy = RetryPolicy::job_enqueue().with_backoff(self.config.retry);
        let project = self.config.project_id.as_str();
        let response = policy
            .run(cancel, "query", || self.jobs.query(project, request.clone()))
            .await?;

        info!(
            job_id = ?response.job_reference,
            query_id = ?response.query_id,
            complete = ?response.job_complete,
            "Query submitted"
        );
        QueryHandle::from_response(response, self.services(), self.config.clone(), cancel.clone())
    }

    /// Handle for a query job, inserted in the background.
    pub fn insert_query_job(&self, job: Job, cancel: &CancellationToken) -> Result<QueryHandle, QueryError> {
        QueryHandle::insert(job, self.services(), self.config.clone(), cancel.clone())
    }

    /// Handle for an existing job.
    pub fn attach_job(
        &self,
        reference: JobReference,
        cancel: &CancellationToken,
    ) -> Result<QueryHandle, QueryError> {
        QueryHandle::attach(reference, self.services(), self.config.clone(), cancel.clone())
    }

    /// Completion controller for any job, polling the job itself.
    pub fn job_waiter(
        &self,
        reference: JobReference,
        cancel: &CancellationToken,
    ) -> Result<JobController, QueryError> {
        if reference.job_id.is_empty() {
            return Err(QueryError::MissingJobId);
        }

        let jobs = self.jobs.clone();
        let policy = RetryPolicy::read().with_backoff(self.config.retry);
        let wait = JobStep::new(move |ctx: StepContext| {
            let jobs = jobs.clone();
            let policy = policy.clone();
            async move {
                let reference = ctx.job_reference.ok_or(QueryError::MissingJobReference)?;
                policy.run(&ctx.cancel, "getJob", || jobs.get_job(&reference)).await
            }
        });

        let controller = JobController::builder(wait)
            .job_reference(reference)
            .poll_backoff(self.config.job_poll)
            .cancel(cancel.clone())
            .build();
        controller.start();
        Ok(controller)
    }

    /// Rows of `table`, read in parallel over the read service.
    pub async fn read_table(
        &self,
        table: &TableReference,
        cancel: &CancellationToken,
    ) -> Result<RowIterator, QueryError> {
        let source = self.open_table(table, cancel).await?;
        Ok(RowIterator::new(Box::new(source)))
    }

    /// Raw Arrow batches of `table`.
    pub async fn read_table_batches(
        &self,
        table: &TableReference,
        cancel: &CancellationToken,
    ) -> Result<BatchIterator, QueryError> {
        let source = self.open_table(table, cancel).await?;
        Ok(BatchIterator::new(source))
    }

    async fn open_table(
        &self,
        table: &TableReference,
        cancel: &CancellationToken,
    ) -> Result<StreamingSource, QueryError> {
        let reader = self.reader.clone().ok_or(QueryError::NoReadClient)?;
        info!(table = %table.resource_name(), "Reading table");
        StreamingSource::open_table(table, &self.jobs, reader, &self.config, cancel).await
    }

    fn services(&self) -> Services {
        Services {
            jobs: self.jobs.clone(),
            reader: self.reader.clone(),
        }
    }
}
