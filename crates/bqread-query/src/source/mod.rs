//! Result sources and the row iterator on top of them

mod polling;
mod streaming;

pub use polling::PollingSource;
pub use streaming::{ArrowBatch, BatchIterator, StreamingSource};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;

use bqread_types::{Row, SchemaView};

use crate::error::QueryError;

/// One chunk of decoded rows.
#[derive(Debug, Clone)]
pub struct Page {
    pub rows: Vec<Row>,
    /// Continuation token; `None` on the last page and on stream batches.
    pub next_token: Option<String>,
    pub total_rows: Option<u64>,
}

/// Where rows come from. `Ok(None)` means the results are exhausted.
#[async_trait]
pub trait ResultSource: Send {
    async fn next_page(&mut self) -> Result<Option<Page>, QueryError>;

    fn schema(&self) -> Option<SchemaView>;

    /// True for the parallel read-stream path.
    fn is_accelerated(&self) -> bool;
}

pub struct RowIterator {
    source: Box<dyn ResultSource>,
    buffer: VecDeque<Row>,
    total_rows: Option<u64>,
    exhausted: bool,
    error: Option<QueryError>,
}

impl RowIterator {
    pub fn new(source: Box<dyn ResultSource>) -> Self {
        Self {
            source,
            buffer: VecDeque::new(),
            total_rows: None,
            exhausted: false,
            error: None,
        }
    }

    /// Next row, `Ok(None)` once exhausted. Errors are sticky.
    pub async fn next(&mut self) -> Result<Option<Row>, QueryError> {
        loop {
            if let Some(err) = &self.error {
                return Err(err.clone());
            }
            if let Some(row) = self.buffer.pop_front() {
                return Ok(Some(row));
            }
            if self.exhausted {
                return Ok(None);
            }

            match self.source.next_page().await {
                Ok(Some(page)) => {
                    if page.total_rows.is_some() {
                        self.total_rows = page.total_rows;
                    }
                    self.buffer.extend(page.rows);
                }
                Ok(None) => self.exhausted = true,
                Err(err) => self.error = Some(err),
            }
        }
    }

    /// Drain every remaining row.
    pub async fn collect(mut self) -> Result<Vec<Row>, QueryError> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Stream of rows ending after the first error.
    pub fn into_stream(self) -> BoxStream<'static, Result<Row, QueryError>> {
        stream::unfold(Some(self), |state| async move {
            let mut iter = state?;
            match iter.next().await {
                Ok(Some(row)) => Some((Ok(row), Some(iter))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }

    pub fn schema(&self) -> Option<SchemaView> {
        self.source.schema()
    }

    /// Total row count reported by the server, once a page has been read.
    pub fn total_rows(&self) -> Option<u64> {
        self.total_rows
    }

    pub fn is_accelerated(&self) -> bool {
        self.source.is_accelerated()
    }
}
