//! Handle over one query or job execution

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use bqread_types::{
    DataFormatOptions, GetQueryResultsRequest, Job, JobReference, QueryResponse, SchemaView,
    TableSchema,
};

use crate::config::ClientConfig;
use crate::error::QueryError;
use crate::job::{CompletionSource, JobController, JobStep, StepContext};
use crate::retry::RetryPolicy;
use crate::rpc::{JobService, ReadService};
use crate::source::{BatchIterator, PollingSource, RowIterator, StreamingSource};

#[derive(Clone)]
pub(crate) struct Services {
    pub jobs: Arc<dyn JobService>,
    pub reader: Option<Arc<dyn ReadService>>,
}

/// First page delivered inline with a synchronous query response.
#[derive(Debug, Clone)]
pub(crate) struct CachedPage {
    pub rows: Vec<serde_json::Value>,
    pub page_token: Option<String>,
    pub total_rows: Option<u64>,
}

impl CachedPage {
    fn is_last(&self) -> bool {
        self.page_token.as_deref().map_or(true, str::is_empty)
    }
}

#[derive(Default)]
pub(crate) struct HandleState {
    query_id: OnceLock<String>,
    schema: OnceLock<SchemaView>,
    first_page: OnceLock<CachedPage>,
    total_rows: Mutex<Option<u64>>,
}

impl HandleState {
    fn absorb(&self, schema: Option<&TableSchema>, total_rows: Option<u64>) {
        if let Some(schema) = schema {
            self.schema.get_or_init(|| SchemaView::new(schema.clone()));
        }
        if total_rows.is_some() {
            *self.total_rows.lock().unwrap_or_else(PoisonError::into_inner) = total_rows;
        }
    }
}

/// One query/job execution: identity, completion tracking and result access.
///
/// Every constructor starts the completion controller, so handles must be
/// built inside a Tokio runtime. Cheap to clone; clones share the same
/// completion state and caches.
#[derive(Clone)]
pub struct QueryHandle {
    state: Arc<HandleState>,
    controller: JobController,
    services: Services,
    config: Arc<ClientConfig>,
}

impl QueryHandle {
    /// Build from a synchronous query response, caching its inline page.
    pub(crate) fn from_response(
        response: QueryResponse,
        services: Services,
        config: Arc<ClientConfig>,
        cancel: CancellationToken,
    ) -> Result<Self, QueryError> {
        let complete = response.job_complete.unwrap_or(false);
        if !complete && response.job_reference.is_none() {
            return Err(QueryError::MissingJobReference);
        }

        let state = Arc::new(HandleState::default());
        state.absorb(response.schema.as_ref(), response.total_rows);
        if let Some(query_id) = &response.query_id {
            let _ = state.query_id.set(query_id.clone());
        }
        if complete {
            let _ = state.first_page.set(CachedPage {
                rows: response.rows.clone(),
                page_token: response.page_token.clone(),
                total_rows: response.total_rows,
            });
        }

        let mut builder = JobController::builder(poll_step(&state, &services, &config))
            .poll_backoff(config.job_poll)
            .cancel(cancel)
            .initial(response.completion_signals());
        if let Some(reference) = response.job_reference {
            builder = builder.job_reference(reference);
        }

        let controller = builder.build();
        controller.start();

        Ok(Self {
            state,
            controller,
            services,
            config,
        })
    }

    /// Build from a job definition; the insert is issued in the background.
    pub(crate) fn insert(
        mut job: Job,
        services: Services,
        config: Arc<ClientConfig>,
        cancel: CancellationToken,
    ) -> Result<Self, QueryError> {
        if job.query_config().is_none() {
            return Err(QueryError::MissingQueryConfig);
        }

        let mut reference = job.job_reference.take().unwrap_or_default();
        if reference.project_id.is_empty() {
            reference.project_id = config.project_id.clone();
        }
        if reference.job_id.is_empty() {
            reference.job_id = Uuid::new_v4().to_string();
        }
        if reference.location.is_none() {
            reference.location = config.location.clone();
        }
        job.job_reference = Some(reference.clone());

        let jobs = services.jobs.clone();
        let policy = RetryPolicy::job_enqueue().with_backoff(config.retry);
        let project = reference.project_id.clone();
        let create = JobStep::new(move |ctx: StepContext| {
            let jobs = jobs.clone();
            let policy = policy.clone();
            let project = project.clone();
            let job = job.clone();
            async move {
                info!(job_id = ?job.job_reference, "Inserting query job");
                policy
                    .run(&ctx.cancel, "insertJob", || jobs.insert_job(&project, job.clone()))
                    .await
            }
        });

        let state = Arc::new(HandleState::default());
        let controller = JobController::builder(poll_step(&state, &services, &config))
            .create(create)
            .job_reference(reference)
            .poll_backoff(config.job_poll)
            .cancel(cancel)
            .build();
        controller.start();

        Ok(Self {
            state,
            controller,
            services,
            config,
        })
    }

    /// Attach to a job that already exists.
    pub(crate) fn attach(
        reference: JobReference,
        services: Services,
        config: Arc<ClientConfig>,
        cancel: CancellationToken,
    ) -> Result<Self, QueryError> {
        if reference.job_id.is_empty() {
            return Err(QueryError::MissingJobId);
        }

        let state = Arc::new(HandleState::default());
        let controller = JobController::builder(poll_step(&state, &services, &config))
            .job_reference(reference)
            .poll_backoff(config.job_poll)
            .cancel(cancel)
            .build();
        controller.start();

        Ok(Self {
            state,
            controller,
            services,
            config,
        })
    }

    /// Block until the job completes or `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), QueryError> {
        self.controller.wait(cancel).await
    }

    /// Wait for completion, then open the cheapest source for the results.
    pub async fn read(&self, cancel: &CancellationToken) -> Result<RowIterator, QueryError> {
        self.wait(cancel).await?;

        let cached_only = self.state.first_page.get().is_some_and(CachedPage::is_last);
        match &self.services.reader {
            Some(reader) if !cached_only => {
                debug!(job_id = ?self.job_reference(), "Reading results over read streams");
                let source = StreamingSource::open(self, reader.clone(), cancel).await?;
                Ok(RowIterator::new(Box::new(source)))
            }
            _ => {
                debug!(job_id = ?self.job_reference(), cached_only, "Reading results by page");
                Ok(RowIterator::new(Box::new(PollingSource::new(self.clone(), cancel.clone()))))
            }
        }
    }

    /// Wait for completion, then stream the destination table as raw Arrow
    /// batches. Needs a read client.
    pub async fn read_batches(&self, cancel: &CancellationToken) -> Result<BatchIterator, QueryError> {
        self.wait(cancel).await?;
        let reader = self.services.reader.clone().ok_or(QueryError::NoReadClient)?;
        let source = StreamingSource::open(self, reader, cancel).await?;
        Ok(BatchIterator::new(source))
    }

    pub fn complete(&self) -> bool {
        self.controller.complete()
    }

    pub fn job_reference(&self) -> Option<JobReference> {
        self.controller.job_reference()
    }

    pub fn schema(&self) -> Option<SchemaView> {
        self.state.schema.get().cloned()
    }

    /// Server-assigned id of a query that ran without creating a job.
    pub fn query_id(&self) -> Option<&str> {
        self.state.query_id.get().map(String::as_str)
    }

    pub fn total_rows(&self) -> Option<u64> {
        *self.state.total_rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn done(&self) {
        self.controller.done().await
    }

    pub fn err(&self) -> Option<QueryError> {
        self.controller.err()
    }

    pub(crate) fn jobs(&self) -> &Arc<dyn JobService> {
        &self.services.jobs
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn cached_first_page(&self) -> Option<&CachedPage> {
        self.state.first_page.get()
    }

    /// Fix the schema on first sight; later calls return the cached view.
    pub(crate) fn resolve_schema(&self, schema: Option<&TableSchema>) -> Result<SchemaView, QueryError> {
        if let Some(view) = self.state.schema.get() {
            return Ok(view.clone());
        }
        let schema = schema.ok_or(QueryError::MissingSchema)?;
        Ok(self
            .state
            .schema
            .get_or_init(|| SchemaView::new(schema.clone()))
            .clone())
    }

    pub(crate) fn record_total_rows(&self, total_rows: Option<u64>) {
        self.state.absorb(None, total_rows);
    }
}

/// Zero-row results poll used purely for completion and metadata.
fn poll_step(state: &Arc<HandleState>, services: &Services, config: &ClientConfig) -> JobStep {
    let state = state.clone();
    let jobs = services.jobs.clone();
    let policy = RetryPolicy::read().with_backoff(config.retry);
    let use_int64_timestamp = config.read.use_int64_timestamp;

    JobStep::new(move |ctx: StepContext| {
        let state = state.clone();
        let jobs = jobs.clone();
        let policy = policy.clone();
        async move {
            let reference = ctx.job_reference.ok_or(QueryError::MissingJobReference)?;
            let mut request = GetQueryResultsRequest::for_job(&reference);
            request.max_results = Some(0);
            request.format_options = Some(DataFormatOptions { use_int64_timestamp });

            let response = policy
                .run(&ctx.cancel, "getQueryResults", || jobs.get_query_results(request.clone()))
                .await?;
            state.absorb(response.schema.as_ref(), response.total_rows);
            Ok(response)
        }
    })
}
