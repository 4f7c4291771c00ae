//! Parallel columnar reads of a table
//!
//! One read session is opened for the table (a job's destination table or
//! one named directly) and every stream it returns gets its own worker task.
//! Workers push raw batches into a shared bounded queue; the iterator side
//! decodes them. Each worker holds a sender clone, so the queue closing means
//! every stream has finished.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bqread_decode::ColumnarDecoder;
use bqread_types::{CreateReadSessionRequest, DataFormat, ReadRowsRequest, SchemaView, TableReference};

use super::{Page, ResultSource};
use crate::config::ClientConfig;
use crate::error::{QueryError, RpcError};
use crate::handle::QueryHandle;
use crate::retry::{is_retryable_stream_error, BackoffConfig, RetryPolicy};
use crate::rpc::{JobService, ReadService};

/// One serialized record batch message as a read stream delivered it.
#[derive(Debug, Clone)]
pub struct ArrowBatch {
    pub stream: String,
    /// Stream offset of the batch's first row.
    pub offset: i64,
    pub row_count: i64,
    pub data: Vec<u8>,
}

type Message = Result<ArrowBatch, QueryError>;

/// What a read session is opened over.
struct ReadTarget {
    /// Project billed for the session.
    project: String,
    table: TableReference,
    schema: SchemaView,
    total_rows: Option<u64>,
}

pub struct StreamingSource {
    schema: SchemaView,
    decoder: ColumnarDecoder,
    queue: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    workers: CancellationToken,
    session: String,
    streams: usize,
    total_rows: Option<u64>,
}

impl StreamingSource {
    /// Resolve the job's destination table and open a read session over it.
    pub async fn open(
        handle: &QueryHandle,
        reader: Arc<dyn ReadService>,
        cancel: &CancellationToken,
    ) -> Result<Self, QueryError> {
        let reference = handle
            .job_reference()
            .ok_or(QueryError::MissingJobReference)?;
        let jobs = handle.jobs();
        let config = handle.config();
        let policy = RetryPolicy::read().with_backoff(config.retry);

        let job = policy
            .run(cancel, "getJob", || jobs.get_job(&reference))
            .await?;
        let table = job
            .query_config()
            .and_then(|query| query.destination_table.clone())
            .ok_or_else(|| QueryError::NoDestinationTable(reference.to_string()))?;

        let schema = match handle.schema() {
            Some(schema) => schema,
            None => {
                let meta = policy
                    .run(cancel, "getTable", || jobs.get_table(&table))
                    .await?;
                handle.resolve_schema(meta.schema.as_ref())?
            }
        };

        debug!(job_id = %reference, table = %table.resource_name(), "Reading job destination table");
        let target = ReadTarget {
            project: reference.project_id.clone(),
            table,
            schema,
            total_rows: handle.total_rows(),
        };
        Self::start(target, reader, config, cancel).await
    }

    /// Open a read session over `table` directly, taking the schema and row
    /// count from the table's metadata.
    pub async fn open_table(
        table: &TableReference,
        jobs: &Arc<dyn JobService>,
        reader: Arc<dyn ReadService>,
        config: &ClientConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, QueryError> {
        let policy = RetryPolicy::read().with_backoff(config.retry);
        let meta = policy
            .run(cancel, "getTable", || jobs.get_table(table))
            .await?;
        let schema = meta.schema.map(SchemaView::new).ok_or(QueryError::MissingSchema)?;

        let target = ReadTarget {
            project: config.project_id.clone(),
            table: table.clone(),
            schema,
            total_rows: meta.num_rows,
        };
        Self::start(target, reader, config, cancel).await
    }

    /// Create the session and start one worker per stream.
    async fn start(
        target: ReadTarget,
        reader: Arc<dyn ReadService>,
        config: &ClientConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, QueryError> {
        let policy = RetryPolicy::read().with_backoff(config.retry);
        let request = CreateReadSessionRequest {
            parent: format!("projects/{}", target.project),
            table: target.table.resource_name(),
            data_format: DataFormat::Arrow,
            max_stream_count: 0,
            preferred_min_stream_count: 1,
        };
        let session = policy
            .run(cancel, "createReadSession", || {
                reader.create_read_session(request.clone())
            })
            .await?;
        let decoder = ColumnarDecoder::new(session.arrow_schema.clone(), target.schema.clone())?;

        let parallelism = config
            .read
            .max_stream_workers
            .unwrap_or(session.streams.len())
            .max(1);
        let (tx, queue) = mpsc::channel(parallelism + 1);
        let gate = Arc::new(Semaphore::new(parallelism));
        let workers = cancel.child_token();

        info!(
            table = %target.table.resource_name(),
            session = %session.name,
            streams = session.streams.len(),
            parallelism,
            estimated_rows = session.estimated_row_count,
            "Opened read session"
        );

        let streams = session.streams.len();
        for stream in session.streams {
            let worker = StreamWorker {
                reader: reader.clone(),
                stream: stream.name,
                queue: tx.clone(),
                gate: gate.clone(),
                cancel: workers.clone(),
                backoff: config.retry,
            };
            tokio::spawn(worker.run());
        }
        drop(tx);

        Ok(Self {
            schema: target.schema,
            decoder,
            queue,
            cancel: cancel.clone(),
            workers,
            session: session.name,
            streams,
            total_rows: target.total_rows,
        })
    }

    pub fn session_name(&self) -> &str {
        &self.session
    }

    pub fn stream_count(&self) -> usize {
        self.streams
    }

    /// Next raw batch from whichever stream delivers first; `Ok(None)` once
    /// every stream has finished.
    pub async fn next_batch(&mut self) -> Result<Option<ArrowBatch>, QueryError> {
        let message = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.workers.cancel();
                return Err(QueryError::Cancelled);
            }
            message = self.queue.recv() => message,
        };

        match message {
            None => Ok(None),
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(err)) => {
                self.workers.cancel();
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ResultSource for StreamingSource {
    async fn next_page(&mut self) -> Result<Option<Page>, QueryError> {
        let batch = match self.next_batch().await? {
            Some(batch) => batch,
            None => return Ok(None),
        };

        let first_row = usize::try_from(batch.offset).unwrap_or_default();
        let rows = self
            .decoder
            .decode_batch_at(&batch.data, first_row)
            .map_err(|source| {
                self.workers.cancel();
                QueryError::StreamDecode {
                    stream: batch.stream.clone(),
                    source,
                }
            })?;

        Ok(Some(Page {
            rows,
            next_token: None,
            total_rows: self.total_rows,
        }))
    }

    fn schema(&self) -> Option<SchemaView> {
        Some(self.schema.clone())
    }

    fn is_accelerated(&self) -> bool {
        true
    }
}

impl Drop for StreamingSource {
    fn drop(&mut self) {
        self.workers.cancel();
    }
}

/// Raw columnar batches straight off the read streams, for callers that hand
/// them to their own Arrow tooling instead of decoding rows.
pub struct BatchIterator {
    source: StreamingSource,
    exhausted: bool,
    error: Option<QueryError>,
}

impl BatchIterator {
    pub fn new(source: StreamingSource) -> Self {
        Self {
            source,
            exhausted: false,
            error: None,
        }
    }

    /// Next batch, `Ok(None)` once exhausted. Errors are sticky.
    pub async fn next(&mut self) -> Result<Option<ArrowBatch>, QueryError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.exhausted {
            return Ok(None);
        }
        match self.source.next_batch().await {
            Ok(Some(batch)) => Ok(Some(batch)),
            Ok(None) => {
                self.exhausted = true;
                Ok(None)
            }
            Err(err) => {
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Stream of batches ending after the first error.
    pub fn into_stream(self) -> BoxStream<'static, Result<ArrowBatch, QueryError>> {
        stream::unfold(Some(self), |state| async move {
            let mut iter = state?;
            match iter.next().await {
                Ok(Some(batch)) => Some((Ok(batch), Some(iter))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
        .boxed()
    }

    /// Parse `batch` against the session's schema message.
    pub fn record_batches(&self, batch: &ArrowBatch) -> Result<Vec<RecordBatch>, QueryError> {
        self.source
            .decoder
            .read_record_batches(&batch.data)
            .map_err(|source| QueryError::StreamDecode {
                stream: batch.stream.clone(),
                source,
            })
    }

    /// The session's IPC schema message; prepend it to any batch's `data` to
    /// get a complete Arrow stream.
    pub fn serialized_schema(&self) -> &[u8] {
        self.source.decoder.serialized_schema()
    }

    pub fn schema(&self) -> &SchemaView {
        &self.source.schema
    }

    pub fn total_rows(&self) -> Option<u64> {
        self.source.total_rows
    }

    pub fn session_name(&self) -> &str {
        self.source.session_name()
    }

    pub fn stream_count(&self) -> usize {
        self.source.stream_count()
    }
}

struct StreamWorker {
    reader: Arc<dyn ReadService>,
    stream: String,
    queue: mpsc::Sender<Message>,
    gate: Arc<Semaphore>,
    cancel: CancellationToken,
    backoff: BackoffConfig,
}

impl StreamWorker {
    async fn run(self) {
        let _permit = tokio::select! {
            permit = self.gate.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = self.cancel.cancelled() => return,
        };

        let mut offset = 0i64;
        let mut backoff = self.backoff.backoff();
        loop {
            let resumed_at = offset;
            let err = match self.consume(&mut offset).await {
                Ok(()) => {
                    debug!(stream = %self.stream, rows = offset, "Read stream finished");
                    return;
                }
                Err(err) => err,
            };

            if !is_retryable_stream_error(&err) {
                let message = Err(QueryError::Stream {
                    stream: self.stream.clone(),
                    source: err,
                });
                tokio::select! {
                    _ = self.queue.send(message) => {}
                    _ = self.cancel.cancelled() => {}
                }
                return;
            }

            if offset > resumed_at {
                backoff = self.backoff.backoff();
            }
            let delay = backoff.pause();
            warn!(
                stream = %self.stream,
                offset,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Read stream interrupted; resuming"
            );
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = self.cancel.cancelled() => true,
            };
            if cancelled {
                return;
            }
        }
    }

    /// Read from `offset` until the stream ends, advancing it per batch.
    /// Returns `Ok` early when cancelled or when nobody is listening.
    async fn consume(&self, offset: &mut i64) -> Result<(), RpcError> {
        let request = ReadRowsRequest {
            read_stream: self.stream.clone(),
            offset: *offset,
        };
        let mut rows = tokio::select! {
            rows = self.reader.read_rows(request) => rows?,
            _ = self.cancel.cancelled() => return Ok(()),
        };

        loop {
            let next = tokio::select! {
                next = rows.next() => next,
                _ = self.cancel.cancelled() => return Ok(()),
            };
            let response = match next {
                None => return Ok(()),
                Some(response) => response?,
            };

            let batch = ArrowBatch {
                stream: self.stream.clone(),
                offset: *offset,
                row_count: response.row_count,
                data: response.arrow_record_batch,
            };
            *offset += batch.row_count;
            let delivered = tokio::select! {
                sent = self.queue.send(Ok(batch)) => sent.is_ok(),
                _ = self.cancel.cancelled() => false,
            };
            if !delivered {
                return Ok(());
            }
        }
    }
}
