//! In-memory job and read services for integration tests
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;

use bqread_decode::encode_ipc_payload;
use bqread_query::{ClientConfig, JobService, ReadRowsStream, ReadService, RpcError};
use bqread_types::{
    CreateReadSessionRequest, FieldSchema, FieldType, GetQueryResultsRequest,
    GetQueryResultsResponse, Job, JobReference, JobStatus, QueryRequest, QueryResponse,
    ReadRowsRequest, ReadRowsResponse, ReadSession, ReadStream, SchemaView, Table, TableReference,
    TableSchema,
};

pub const PROJECT: &str = "test-project";

/// Client config with millisecond backoffs so retries stay fast.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new(PROJECT);
    config.location = Some("US".to_string());
    config.retry.initial_ms = 1;
    config.retry.max_ms = 4;
    config.retry.jitter = false;
    config.job_poll.initial_ms = 1;
    config.job_poll.max_ms = 4;
    config
}

pub fn job_reference() -> JobReference {
    JobReference::new(PROJECT, "job-1").with_location("US")
}

pub fn destination() -> TableReference {
    TableReference::new(PROJECT, "_anon", "results")
}

/// Two columns: `id INTEGER, name STRING`.
pub fn id_name_schema() -> TableSchema {
    TableSchema::new(vec![
        FieldSchema::new("id", FieldType::Integer),
        FieldSchema::new("name", FieldType::String),
    ])
}

/// Document-form row for the `id, name` schema.
pub fn wire_row(id: i64) -> serde_json::Value {
    json!({"f": [{"v": id.to_string()}, {"v": format!("row-{id}")}]})
}

/// Query job whose results land in [`destination`].
pub fn query_job(done: bool) -> Job {
    let mut job = Job::query("SELECT id, name FROM t");
    job.job_reference = Some(job_reference());
    if let Some(query) = job.configuration.as_mut().and_then(|c| c.query.as_mut()) {
        query.destination_table = Some(destination());
    }
    job.status = Some(JobStatus {
        state: if done { "DONE" } else { "RUNNING" }.to_string(),
        ..Default::default()
    });
    job
}

#[derive(Default)]
pub struct Calls {
    pub insert_job: AtomicUsize,
    pub get_job: AtomicUsize,
    pub get_query_results: AtomicUsize,
    pub query: AtomicUsize,
    pub get_table: AtomicUsize,
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

#[derive(Default)]
struct JobState {
    query_response: QueryResponse,
    query_failures: VecDeque<RpcError>,
    query_requests: Vec<QueryRequest>,
    job: Job,
    inserted: Vec<Job>,
    /// Results polls answered with `jobComplete: false` before completion.
    pending_polls: usize,
    /// Pages keyed by token; the first page is keyed by "".
    pages: HashMap<String, GetQueryResultsResponse>,
    results_failures: VecDeque<RpcError>,
    results_requests: Vec<GetQueryResultsRequest>,
    table: Table,
}

#[derive(Default)]
pub struct FakeJobService {
    state: Mutex<JobState>,
    pub calls: Calls,
}

impl FakeJobService {
    pub fn new() -> Self {
        let service = Self::default();
        service.state.lock().unwrap().job = query_job(true);
        service
    }

    pub fn with_query_response(self, response: QueryResponse) -> Self {
        self.state.lock().unwrap().query_response = response;
        self
    }

    pub fn with_job(self, job: Job) -> Self {
        self.state.lock().unwrap().job = job;
        self
    }

    pub fn with_pending_polls(self, polls: usize) -> Self {
        self.state.lock().unwrap().pending_polls = polls;
        self
    }

    pub fn with_table(self, table: Table) -> Self {
        self.state.lock().unwrap().table = table;
        self
    }

    pub fn fail_query(self, err: RpcError) -> Self {
        self.state.lock().unwrap().query_failures.push_back(err);
        self
    }

    pub fn fail_results(self, err: RpcError) -> Self {
        self.state.lock().unwrap().results_failures.push_back(err);
        self
    }

    /// Serve `pages` of ids in order, chained by tokens `t1`, `t2`, ...
    pub fn with_pages(self, schema: Option<TableSchema>, pages: &[Vec<i64>]) -> Self {
        let total: usize = pages.iter().map(Vec::len).sum();
        {
            let mut state = self.state.lock().unwrap();
            for (i, ids) in pages.iter().enumerate() {
                let key = if i == 0 { String::new() } else { format!("t{i}") };
                let next = (i + 1 < pages.len()).then(|| format!("t{}", i + 1));
                state.pages.insert(
                    key,
                    GetQueryResultsResponse {
                        job_reference: Some(job_reference()),
                        job_complete: Some(true),
                        schema: schema.clone(),
                        rows: ids.iter().map(|id| wire_row(*id)).collect(),
                        total_rows: Some(total as u64),
                        page_token: next,
                        errors: Vec::new(),
                    },
                );
            }
        }
        self
    }

    pub fn query_requests(&self) -> Vec<QueryRequest> {
        self.state.lock().unwrap().query_requests.clone()
    }

    pub fn results_requests(&self) -> Vec<GetQueryResultsRequest> {
        self.state.lock().unwrap().results_requests.clone()
    }

    pub fn inserted(&self) -> Vec<Job> {
        self.state.lock().unwrap().inserted.clone()
    }
}

#[async_trait]
impl JobService for FakeJobService {
    async fn insert_job(&self, _project_id: &str, mut job: Job) -> Result<Job, RpcError> {
        self.calls.insert_job.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.inserted.push(job.clone());
        job.status = state.job.status.clone();
        Ok(job)
    }

    async fn get_job(&self, _job: &JobReference) -> Result<Job, RpcError> {
        self.calls.get_job.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().job.clone())
    }

    async fn get_query_results(
        &self,
        request: GetQueryResultsRequest,
    ) -> Result<GetQueryResultsResponse, RpcError> {
        self.calls.get_query_results.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.results_requests.push(request.clone());
        if let Some(err) = state.results_failures.pop_front() {
            return Err(err);
        }

        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            return Ok(GetQueryResultsResponse {
                job_reference: Some(job_reference()),
                job_complete: Some(false),
                ..Default::default()
            });
        }

        let token = request.page_token.unwrap_or_default();
        let mut page = state
            .pages
            .get(&token)
            .cloned()
            .ok_or_else(|| RpcError::api(400, Some("invalid"), format!("unknown page token {token:?}")))?;
        if request.max_results == Some(0) {
            page.rows.clear();
        }
        Ok(page)
    }

    async fn query(&self, _project_id: &str, request: QueryRequest) -> Result<QueryResponse, RpcError> {
        self.calls.query.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.query_requests.push(request);
        if let Some(err) = state.query_failures.pop_front() {
            return Err(err);
        }
        Ok(state.query_response.clone())
    }

    async fn get_table(&self, _table: &TableReference) -> Result<Table, RpcError> {
        self.calls.get_table.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().table.clone())
    }
}

/// Record batch of `ids` for the `id, name` schema.
pub fn id_batch(ids: &[i64]) -> RecordBatch {
    let schema = SchemaView::new(id_name_schema()).columnar_schema();
    let names: Vec<String> = ids.iter().map(|id| format!("row-{id}")).collect();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(ids.to_vec())) as ArrayRef,
            Arc::new(StringArray::from(names)) as ArrayRef,
        ],
    )
    .unwrap()
}

struct ScriptedFailure {
    /// Batches delivered before the error.
    after: usize,
    error: RpcError,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeReadService {
    session: ReadSession,
    batches: HashMap<String, Vec<ReadRowsResponse>>,
    failures: Mutex<HashMap<String, VecDeque<ScriptedFailure>>>,
    hanging: Vec<String>,
    pub session_requests: Mutex<Vec<CreateReadSessionRequest>>,
    pub read_requests: Mutex<Vec<ReadRowsRequest>>,
    active: Arc<AtomicUsize>,
    pub max_active: AtomicUsize,
}

impl FakeReadService {
    /// One stream per entry, each serving its batches of ids in order.
    pub fn new(streams: &[Vec<Vec<i64>>]) -> Self {
        let schema = SchemaView::new(id_name_schema()).columnar_schema();
        let records: Vec<Vec<RecordBatch>> = streams
            .iter()
            .map(|stream| stream.iter().map(|ids| id_batch(ids)).collect())
            .collect();
        Self::from_records(&schema, &records)
    }

    /// One stream per entry, serving arbitrary record batches of `schema`.
    pub fn from_records(schema: &Schema, streams: &[Vec<RecordBatch>]) -> Self {
        let header = encode_ipc_payload(schema, &[]).unwrap().0;
        let mut batches = HashMap::new();
        let mut names = Vec::new();

        for (i, records) in streams.iter().enumerate() {
            let (_, messages) = encode_ipc_payload(schema, records).unwrap();
            let name = format!("sessions/s1/streams/{i}");
            let responses = messages
                .into_iter()
                .zip(records)
                .map(|(bytes, record)| ReadRowsResponse {
                    row_count: record.num_rows() as i64,
                    arrow_record_batch: bytes,
                })
                .collect();
            batches.insert(name.clone(), responses);
            names.push(name);
        }

        Self {
            session: ReadSession {
                name: "sessions/s1".to_string(),
                streams: names.into_iter().map(|name| ReadStream { name }).collect(),
                arrow_schema: header,
                estimated_row_count: 0,
            },
            batches,
            ..Default::default()
        }
    }

    pub fn stream_name(&self, index: usize) -> String {
        self.session.streams[index].name.clone()
    }

    /// Fail the next read of `stream` after `after` batches.
    pub fn fail_stream(self, index: usize, after: usize, error: RpcError) -> Self {
        let name = self.stream_name(index);
        self.failures
            .lock()
            .unwrap()
            .entry(name)
            .or_default()
            .push_back(ScriptedFailure { after, error });
        self
    }

    /// Keep `stream` open after its last batch.
    pub fn hang_stream(mut self, index: usize) -> Self {
        let name = self.stream_name(index);
        self.hanging.push(name);
        self
    }

    /// Row streams currently held open by readers.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn read_offsets(&self, index: usize) -> Vec<i64> {
        let name = self.stream_name(index);
        self.read_requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.read_stream == name)
            .map(|r| r.offset)
            .collect()
    }
}

#[async_trait]
impl ReadService for FakeReadService {
    async fn create_read_session(
        &self,
        request: CreateReadSessionRequest,
    ) -> Result<ReadSession, RpcError> {
        self.session_requests.lock().unwrap().push(request);
        Ok(self.session.clone())
    }

    async fn read_rows(&self, request: ReadRowsRequest) -> Result<ReadRowsStream, RpcError> {
        self.read_requests.lock().unwrap().push(request.clone());
        tokio::task::yield_now().await;

        let all = self
            .batches
            .get(&request.read_stream)
            .ok_or_else(|| RpcError::grpc(tonic::Code::NotFound, "no such stream"))?;

        let mut skipped = 0i64;
        let mut items: Vec<Result<ReadRowsResponse, RpcError>> = all
            .iter()
            .skip_while(|batch| {
                let skip = skipped < request.offset;
                skipped += batch.row_count;
                skip
            })
            .cloned()
            .map(Ok)
            .collect();

        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&request.read_stream)
            .and_then(VecDeque::pop_front);
        if let Some(failure) = failure {
            items.truncate(failure.after);
            items.push(Err(failure.error));
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let guard = ActiveGuard(self.active.clone());

        let body = stream::iter(items).map(move |item| {
            let _active = &guard;
            item
        });
        if self.hanging.contains(&request.read_stream) {
            Ok(body.chain(stream::pending()).boxed())
        } else {
            Ok(body.boxed())
        }
    }
}
