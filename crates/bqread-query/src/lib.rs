//! Query execution and result streaming
//!
//! A [`QueryClient`] submits queries or attaches to existing jobs and hands
//! back a [`QueryHandle`]. The handle tracks completion through a
//! [`JobController`] and, once the job is done, reads rows either page by
//! page over the job service ([`PollingSource`]) or in parallel over the
//! read service ([`StreamingSource`]). Both paths yield the same canonical
//! [`bqread_types::Row`]s. Tables can also be read directly over the read
//! service, as rows or as raw Arrow batches ([`BatchIterator`]).

pub mod client;
pub mod config;
pub mod error;
pub mod handle;
pub mod job;
pub mod logging;
pub mod retry;
pub mod rpc;
pub mod source;

pub use client::QueryClient;
pub use config::{ClientConfig, ConfigError, LoggingConfig, ReadConfig};
pub use error::{QueryError, RpcError};
pub use handle::QueryHandle;
pub use job::{
    CompletionSignal, CompletionSource, JobController, JobControllerBuilder, JobStep, StepContext,
};
pub use retry::{is_retryable, is_retryable_stream_error, Backoff, BackoffConfig, RetryPolicy};
pub use rpc::{JobService, ReadRowsStream, ReadService};
pub use source::{
    ArrowBatch, BatchIterator, Page, PollingSource, ResultSource, RowIterator, StreamingSource,
};
