//! Page-by-page results over the job service

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bqread_decode::{RowDecoder, WireDecoder};
use bqread_types::{DataFormatOptions, GetQueryResultsRequest, Row, SchemaView, TableSchema};

use super::{Page, ResultSource};
use crate::error::QueryError;
use crate::handle::QueryHandle;
use crate::retry::RetryPolicy;

pub struct PollingSource {
    handle: QueryHandle,
    cancel: CancellationToken,
    policy: RetryPolicy,
    page_size: Option<u32>,
    delivered_first: bool,
    page_token: Option<String>,
}

impl PollingSource {
    pub fn new(handle: QueryHandle, cancel: CancellationToken) -> Self {
        let policy = RetryPolicy::read().with_backoff(handle.config().retry);
        let page_size = handle.config().read.page_size;
        Self {
            handle,
            cancel,
            policy,
            page_size,
            delivered_first: false,
            page_token: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Fetch and decode the page at `token` (the first page for `None`).
    ///
    /// Does not advance the source, so repeated calls with the same token
    /// return the same rows.
    pub async fn fetch_page(&self, token: Option<&str>) -> Result<Page, QueryError> {
        let reference = self
            .handle
            .job_reference()
            .ok_or(QueryError::MissingJobReference)?;
        let use_int64_timestamp = self.handle.config().read.use_int64_timestamp;

        let mut request = GetQueryResultsRequest::for_job(&reference);
        request.page_token = token.map(str::to_string);
        request.max_results = self.page_size;
        request.format_options = Some(DataFormatOptions { use_int64_timestamp });

        let jobs = self.handle.jobs();
        let mut backoff = self.handle.config().job_poll.backoff();
        loop {
            let response = self
                .policy
                .run(&self.cancel, "getQueryResults", || jobs.get_query_results(request.clone()))
                .await?;

            if response.job_complete == Some(false) {
                let delay = backoff.pause();
                debug!(job_id = %reference, delay_ms = delay.as_millis() as u64, "Results not ready; polling again");
                let cancelled = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = self.cancel.cancelled() => true,
                };
                if cancelled {
                    return Err(QueryError::Cancelled);
                }
                continue;
            }

            self.handle.record_total_rows(response.total_rows);
            let rows = self.decode(response.schema.as_ref(), &response.rows)?;

            debug!(job_id = %reference, rows = rows.len(), "Fetched result page");
            return Ok(Page {
                rows,
                next_token: response.page_token.filter(|t| !t.is_empty()),
                total_rows: response.total_rows,
            });
        }
    }

    fn cached_page(&self) -> Option<Result<Page, QueryError>> {
        let cached = self.handle.cached_first_page()?;
        let page = self.decode(None, &cached.rows).map(|rows| Page {
            rows,
            next_token: cached.page_token.clone().filter(|t| !t.is_empty()),
            total_rows: cached.total_rows,
        });
        Some(page)
    }

    fn decode(&self, schema: Option<&TableSchema>, rows: &[serde_json::Value]) -> Result<Vec<Row>, QueryError> {
        let schema = match self.handle.resolve_schema(schema) {
            Ok(schema) => schema,
            // DDL and DML statements finish without a result schema
            Err(QueryError::MissingSchema) if rows.is_empty() => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let rows = WireDecoder::new(schema)
            .with_int64_timestamp(self.handle.config().read.use_int64_timestamp)
            .decode(rows)?;
        Ok(rows)
    }
}

#[async_trait]
impl ResultSource for PollingSource {
    async fn next_page(&mut self) -> Result<Option<Page>, QueryError> {
        let page = if !self.delivered_first {
            let page = match self.cached_page() {
                Some(page) => page?,
                None => self.fetch_page(None).await?,
            };
            self.delivered_first = true;
            page
        } else {
            let token = match self.page_token.take() {
                Some(token) => token,
                None => return Ok(None),
            };
            match self.fetch_page(Some(&token)).await {
                Ok(page) => page,
                Err(err) => {
                    self.page_token = Some(token);
                    return Err(err);
                }
            }
        };

        self.page_token = page.next_token.clone();
        Ok(Some(page))
    }

    fn schema(&self) -> Option<SchemaView> {
        self.handle.schema()
    }

    fn is_accelerated(&self) -> bool {
        false
    }
}
