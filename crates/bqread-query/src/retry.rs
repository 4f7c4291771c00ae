//! Retry classification and exponential backoff
//!
//! Two allow-lists of structured error reasons exist: one for read and poll
//! calls, and a wider one for calls that enqueue a job. Everything else that
//! is retryable (5xx statuses, transport hiccups, temporary errors, truncated
//! responses) is shared by both.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{QueryError, RpcError};

const READ_REASONS: &[&str] = &["backendError", "rateLimitExceeded"];

const JOB_ENQUEUE_REASONS: &[&str] = &[
    "backendError",
    "rateLimitExceeded",
    "jobRateLimitExceeded",
    "internalError",
];

const RETRYABLE_STATUS: &[u16] = &[500, 502, 503, 504];

const TRANSPORT_HICCUPS: &[&str] = &["connection refused", "connection reset", "http2: stream closed"];

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
    /// Full jitter: each pause is drawn uniformly from `1..=current`.
    #[serde(default)]
    pub jitter: bool,
}

impl BackoffConfig {
    /// 1s doubling up to 32s, used between retries of a failed call.
    pub const fn retry() -> Self {
        Self {
            initial_ms: 1_000,
            multiplier: 2.0,
            max_ms: 32_000,
            jitter: true,
        }
    }

    /// 50ms growing by 1.3 up to 60s, used between job completion polls.
    pub const fn job_poll() -> Self {
        Self {
            initial_ms: 50,
            multiplier: 1.3,
            max_ms: 60_000,
            jitter: false,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            config: *self,
            current_ms: self.initial_ms as f64,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::retry()
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current_ms: f64,
}

impl Backoff {
    /// Next pause; grows the interval for the following call.
    pub fn pause(&mut self) -> Duration {
        let current = (self.current_ms as u64).max(1);
        let delay = if self.config.jitter {
            1 + rand::rng().random_range(0..current)
        } else {
            current
        };
        self.current_ms = (self.current_ms * self.config.multiplier).min(self.config.max_ms as f64);
        Duration::from_millis(delay)
    }
}

pub type RetryPredicate = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    reasons: &'static [&'static str],
    backoff: BackoffConfig,
    should_retry: Option<RetryPredicate>,
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Policy for result reads and completion polls.
    pub fn read() -> Self {
        Self {
            reasons: READ_REASONS,
            backoff: BackoffConfig::retry(),
            should_retry: None,
            max_attempts: None,
        }
    }

    /// Policy for inserting a job or issuing a synchronous query.
    pub fn job_enqueue() -> Self {
        Self {
            reasons: JOB_ENQUEUE_REASONS,
            ..Self::read()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the built-in classification entirely.
    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn reasons(&self) -> &[&'static str] {
        self.reasons
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    pub fn is_retryable(&self, err: &(dyn Error + 'static)) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(err),
            None => is_retryable(err, self.reasons),
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs
    /// out of attempts or `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        mut op: F,
    ) -> Result<T, QueryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let mut backoff = self.backoff.backoff();
        let mut attempt = 1u32;

        loop {
            let result = tokio::select! {
                result = op() => result,
                _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let exhausted = self.max_attempts.is_some_and(|max| attempt >= max);
            if exhausted || !self.is_retryable(&err) {
                return Err(err.into());
            }

            let delay = backoff.pause();
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after transient error"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(QueryError::Cancelled),
            }
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::read()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("reasons", &self.reasons)
            .field("backoff", &self.backoff)
            .field("should_retry", &self.should_retry.is_some())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Walk `err` and its sources; true when any layer is transient.
pub fn is_retryable(err: &(dyn Error + 'static), reasons: &[&str]) -> bool {
    let mut current = Some(err);
    while let Some(layer) = current {
        if layer_is_retryable(layer, reasons) {
            return true;
        }
        current = layer.source();
    }
    false
}

fn layer_is_retryable(err: &(dyn Error + 'static), reasons: &[&str]) -> bool {
    if let Some(rpc) = err.downcast_ref::<RpcError>() {
        match rpc {
            RpcError::Api { code, reason, .. } => {
                if reason.as_deref().is_some_and(|r| reasons.contains(&r))
                    || RETRYABLE_STATUS.contains(code)
                {
                    return true;
                }
            }
            RpcError::Transport { temporary: true, .. } => return true,
            RpcError::Io { kind, .. } if is_transient_io(*kind) => return true,
            _ => {}
        }
    }
    if let Some(io) = err.downcast_ref::<io::Error>() {
        if is_transient_io(io.kind()) {
            return true;
        }
    }

    let message = err.to_string().to_lowercase();
    TRANSPORT_HICCUPS.iter().any(|hiccup| message.contains(hiccup))
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
    )
}

/// Read stream failures that are resumed at the last offset.
pub fn is_retryable_stream_error(err: &RpcError) -> bool {
    use tonic::Code;

    matches!(
        err.grpc_code(),
        Some(Code::Aborted | Code::Cancelled | Code::DeadlineExceeded | Code::Internal | Code::Unavailable)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = BackoffConfig {
            jitter: false,
            ..BackoffConfig::retry()
        }
        .backoff();
        let pauses: Vec<u64> = (0..8).map(|_| backoff.pause().as_millis() as u64).collect();
        assert_eq!(pauses, vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 32_000, 32_000]);

        let mut poll = BackoffConfig::job_poll().backoff();
        assert_eq!(poll.pause(), Duration::from_millis(50));
        assert_eq!(poll.pause(), Duration::from_millis(65));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = BackoffConfig::retry().backoff();
        for cap in [1_000u64, 2_000, 4_000] {
            let pause = backoff.pause().as_millis() as u64;
            assert!((1..=cap).contains(&pause), "pause {} above {}", pause, cap);
        }
    }

    #[test]
    fn test_job_rate_limit_only_retried_on_enqueue() {
        let err = RpcError::api(403, Some("jobRateLimitExceeded"), "too many jobs");
        assert!(RetryPolicy::job_enqueue().is_retryable(&err));
        assert!(!RetryPolicy::read().is_retryable(&err));

        let shared = RpcError::api(403, Some("rateLimitExceeded"), "slow down");
        assert!(RetryPolicy::job_enqueue().is_retryable(&shared));
        assert!(RetryPolicy::read().is_retryable(&shared));
    }

    #[test]
    fn test_status_and_transport_classification() {
        let read = RetryPolicy::read();
        assert!(read.is_retryable(&RpcError::api(503, None, "unavailable")));
        assert!(!read.is_retryable(&RpcError::api(400, Some("invalid"), "bad query")));
        assert!(read.is_retryable(&RpcError::transport("read: connection reset by peer", false)));
        assert!(read.is_retryable(&RpcError::transport("dns lookup", true)));
        assert!(!read.is_retryable(&RpcError::transport("dns lookup", false)));
        assert!(read.is_retryable(&RpcError::from(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated body"
        ))));
    }

    #[test]
    fn test_wrapped_errors_are_unwrapped() {
        let inner = RpcError::api(500, Some("backendError"), "boom");
        let wrapped = inner.wrap("getQueryResults").wrap("page fetch");
        assert!(RetryPolicy::read().is_retryable(&wrapped));

        let query_err = QueryError::from(RpcError::api(403, Some("backendError"), "x").wrap("poll"));
        assert!(RetryPolicy::read().is_retryable(&query_err));
    }

    #[test]
    fn test_source_chain_reaches_every_layer() {
        let wrapped = RpcError::transport("dns lookup", true)
            .wrap("getQueryResults")
            .wrap("page fetch");

        let mut layers = Vec::new();
        let mut current: Option<&(dyn Error + 'static)> = Some(&wrapped);
        while let Some(layer) = current {
            layers.push(layer.downcast_ref::<RpcError>().is_some());
            current = layer.source();
        }
        assert_eq!(layers, vec![true, true, true]);
        assert!(matches!(wrapped.root(), RpcError::Transport { temporary: true, .. }));

        let stream_err = QueryError::Stream {
            stream: "streams/0".to_string(),
            source: RpcError::api(502, None, "bad gateway").wrap("ReadRows"),
        };
        assert!(RetryPolicy::read().is_retryable(&stream_err));
        assert!(!RetryPolicy::read().is_retryable(&RpcError::api(404, Some("notFound"), "gone").wrap("x")));
    }

    #[test]
    fn test_should_retry_override() {
        let policy = RetryPolicy::read().with_should_retry(|_| false);
        assert!(!policy.is_retryable(&RpcError::api(503, None, "unavailable")));
    }

    #[test]
    fn test_stream_error_codes() {
        assert!(is_retryable_stream_error(&RpcError::grpc(tonic::Code::Unavailable, "goaway")));
        assert!(is_retryable_stream_error(
            &RpcError::grpc(tonic::Code::Internal, "rst").wrap("stream")
        ));
        assert!(!is_retryable_stream_error(&RpcError::grpc(tonic::Code::NotFound, "gone")));
        assert!(!is_retryable_stream_error(&RpcError::api(503, None, "x")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let value = RetryPolicy::read()
            .run(&CancellationToken::new(), "test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RpcError::api(503, None, "unavailable"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), _> = RetryPolicy::read()
            .with_max_attempts(2)
            .run(&CancellationToken::new(), "test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RpcError::api(503, None, "unavailable"))
            })
            .await;

        assert!(matches!(result, Err(QueryError::Rpc(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> = RetryPolicy::read()
            .run(&cancel, "test", || std::future::pending())
            .await;
        assert!(matches!(result, Err(QueryError::Cancelled)));
    }
}
