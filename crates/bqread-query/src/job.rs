//! Generic job completion controller
//!
//! A [`JobController`] drives an optional create step followed by a poll
//! loop over a wait step. Steps may return any message type that can report
//! its [`CompletionSignal`]s, so the same controller serves job inserts,
//! synchronous queries and result polls.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use bqread_types::{ErrorProto, GetQueryResultsResponse, Job, JobReference, JobStatus, QueryResponse};

use crate::error::QueryError;
use crate::retry::BackoffConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionSignal {
    /// Job state string; `DONE` means finished, with `error` set on failure.
    Status {
        state: String,
        error: Option<ErrorProto>,
    },
    /// Explicit completion flag. Takes precedence over `Status`.
    Flag(bool),
    /// Identity echoed back by the server.
    Reference(JobReference),
}

pub trait CompletionSource {
    fn completion_signals(&self) -> Vec<CompletionSignal>;
}

impl CompletionSource for Job {
    fn completion_signals(&self) -> Vec<CompletionSignal> {
        let mut signals = Vec::new();
        if let Some(reference) = &self.job_reference {
            signals.push(CompletionSignal::Reference(reference.clone()));
        }
        if let Some(status) = &self.status {
            signals.push(CompletionSignal::Status {
                state: status.state.clone(),
                error: status.error_result.clone(),
            });
        }
        signals
    }
}

impl CompletionSource for QueryResponse {
    fn completion_signals(&self) -> Vec<CompletionSignal> {
        let mut signals = Vec::new();
        if let Some(reference) = &self.job_reference {
            signals.push(CompletionSignal::Reference(reference.clone()));
        }
        if let Some(complete) = self.job_complete {
            signals.push(CompletionSignal::Flag(complete));
        }
        signals
    }
}

impl CompletionSource for GetQueryResultsResponse {
    fn completion_signals(&self) -> Vec<CompletionSignal> {
        let mut signals = Vec::new();
        if let Some(reference) = &self.job_reference {
            signals.push(CompletionSignal::Reference(reference.clone()));
        }
        if let Some(complete) = self.job_complete {
            signals.push(CompletionSignal::Flag(complete));
        }
        signals
    }
}

impl CompletionSource for Vec<CompletionSignal> {
    fn completion_signals(&self) -> Vec<CompletionSignal> {
        self.clone()
    }
}

/// Input handed to each step invocation.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub cancel: CancellationToken,
    /// The controller's job reference as of this call.
    pub job_reference: Option<JobReference>,
}

type StepFn =
    dyn Fn(StepContext) -> BoxFuture<'static, Result<Vec<CompletionSignal>, QueryError>> + Send + Sync;

/// One externally supplied controller operation.
#[derive(Clone)]
pub struct JobStep(Arc<StepFn>);

impl JobStep {
    pub fn new<F, Fut, M>(step: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M, QueryError>> + Send + 'static,
        M: CompletionSource + Send + 'static,
    {
        Self(Arc::new(move |ctx: StepContext| {
            let fut = step(ctx);
            async move { fut.await.map(|message| message.completion_signals()) }.boxed()
        }))
    }

    async fn call(&self, ctx: StepContext) -> Result<Vec<CompletionSignal>, QueryError> {
        (self.0)(ctx).await
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    job_reference: Option<JobReference>,
    complete: bool,
    done: bool,
    error: Option<QueryError>,
}

struct Inner {
    create: Option<JobStep>,
    wait: JobStep,
    poll: BackoffConfig,
    cancel: CancellationToken,
    started: AtomicBool,
    state: Mutex<ControllerState>,
    done_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct JobController {
    inner: Arc<Inner>,
}

pub struct JobControllerBuilder {
    create: Option<JobStep>,
    wait: JobStep,
    job_reference: Option<JobReference>,
    poll: BackoffConfig,
    cancel: CancellationToken,
    initial: Vec<CompletionSignal>,
}

impl JobControllerBuilder {
    pub fn create(mut self, step: JobStep) -> Self {
        self.create = Some(step);
        self
    }

    pub fn job_reference(mut self, reference: JobReference) -> Self {
        self.job_reference = Some(reference);
        self
    }

    pub fn poll_backoff(mut self, poll: BackoffConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Token governing the background poll loop.
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Seed state from a response that was already received.
    pub fn initial(mut self, signals: Vec<CompletionSignal>) -> Self {
        self.initial = signals;
        self
    }

    pub fn build(self) -> JobController {
        let (done_tx, _) = watch::channel(false);
        let controller = JobController {
            inner: Arc::new(Inner {
                create: self.create,
                wait: self.wait,
                poll: self.poll,
                cancel: self.cancel,
                started: AtomicBool::new(false),
                state: Mutex::new(ControllerState {
                    job_reference: self.job_reference,
                    ..Default::default()
                }),
                done_tx,
            }),
        };

        if !self.initial.is_empty() {
            match controller.apply(self.initial) {
                Ok(true) => controller.mark_done(None),
                Ok(false) => {}
                Err(err) => controller.mark_done(Some(err)),
            }
        }
        controller
    }
}

impl JobController {
    pub fn builder(wait: JobStep) -> JobControllerBuilder {
        JobControllerBuilder {
            create: None,
            wait,
            job_reference: None,
            poll: BackoffConfig::job_poll(),
            cancel: CancellationToken::new(),
            initial: Vec::new(),
        }
    }

    /// Launch the background task. Later calls are no-ops.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let controller = self.clone();
        tokio::spawn(async move { controller.run().await });
    }

    /// Resolves once the controller has finished, successfully or not.
    pub async fn done(&self) {
        let mut rx = self.inner.done_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Start if needed and block until completion or until `cancel` fires.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), QueryError> {
        self.start();
        tokio::select! {
            _ = self.done() => match self.err() {
                Some(err) => Err(err),
                None => Ok(()),
            },
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
        }
    }

    /// Final error; `None` until done. Cancellation wins over a stored error.
    pub fn err(&self) -> Option<QueryError> {
        let state = self.state();
        if !state.done {
            return None;
        }
        if self.inner.cancel.is_cancelled() {
            return Some(QueryError::Cancelled);
        }
        state.error.clone()
    }

    pub fn complete(&self) -> bool {
        self.state().complete
    }

    pub fn is_done(&self) -> bool {
        self.state().done
    }

    pub fn job_reference(&self) -> Option<JobReference> {
        self.state().job_reference.clone()
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn context(&self) -> StepContext {
        StepContext {
            cancel: self.inner.cancel.clone(),
            job_reference: self.job_reference(),
        }
    }

    async fn run(&self) {
        if self.is_done() {
            return;
        }

        if let Some(create) = &self.inner.create {
            let result = tokio::select! {
                result = create.call(self.context()) => result,
                _ = self.inner.cancel.cancelled() => Err(QueryError::Cancelled),
            };
            match result.and_then(|signals| self.apply(signals)) {
                Ok(true) => return self.mark_done(None),
                Ok(false) => {}
                Err(err) => return self.mark_done(Some(err)),
            }
        }

        let mut backoff = self.inner.poll.backoff();
        loop {
            let result = tokio::select! {
                result = self.inner.wait.call(self.context()) => result,
                _ = self.inner.cancel.cancelled() => Err(QueryError::Cancelled),
            };
            match result.and_then(|signals| self.apply(signals)) {
                Ok(true) => return self.mark_done(None),
                Ok(false) => {}
                Err(err) => return self.mark_done(Some(err)),
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff.pause()) => {}
                _ = self.inner.cancel.cancelled() => return self.mark_done(Some(QueryError::Cancelled)),
            }
        }
    }

    /// Merge signals into state. Returns whether the job is now complete.
    fn apply(&self, signals: Vec<CompletionSignal>) -> Result<bool, QueryError> {
        let mut flag = None;
        let mut status_done = false;
        let mut failure = None;

        let mut state = self.state();
        for signal in signals {
            match signal {
                CompletionSignal::Reference(reference) => {
                    let location = reference
                        .location
                        .clone()
                        .or_else(|| state.job_reference.as_ref().and_then(|r| r.location.clone()));
                    state.job_reference = Some(JobReference {
                        location,
                        ..reference
                    });
                }
                CompletionSignal::Status { state: job_state, error } => {
                    status_done = job_state == JobStatus::DONE;
                    if status_done {
                        failure = error;
                    }
                }
                CompletionSignal::Flag(complete) => flag = Some(complete),
            }
        }

        let complete = flag.unwrap_or(status_done);
        state.complete = complete;
        drop(state);

        match failure {
            Some(error) if complete => {
                warn!(error = %error, "Job finished with an error");
                Err(QueryError::JobFailed(error))
            }
            _ => Ok(complete),
        }
    }

    /// Transition to done exactly once; later calls are dropped.
    fn mark_done(&self, error: Option<QueryError>) {
        {
            let mut state = self.state();
            if state.done {
                return;
            }
            state.done = true;
            state.error = error;
            match &state.job_reference {
                Some(reference) => debug!(job_id = %reference, failed = state.error.is_some(), "Job controller done"),
                None => debug!(failed = state.error.is_some(), "Job controller done"),
            }
        }
        self.inner.done_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn reference() -> JobReference {
        JobReference::new("p", "job-1").with_location("US")
    }

    /// Wait step reporting completion on the `n`th call.
    fn complete_after(n: usize, calls: Arc<AtomicUsize>) -> JobStep {
        JobStep::new(move |_ctx| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(vec![CompletionSignal::Flag(call >= n)]) }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_complete() {
        let calls = Arc::new(AtomicUsize::new(0));
        let controller = JobController::builder(complete_after(3, calls.clone()))
            .job_reference(reference())
            .build();

        controller.wait(&CancellationToken::new()).await.unwrap();
        assert!(controller.complete());
        assert!(controller.err().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_mark_done_is_idempotent() {
        let controller = JobController::builder(complete_after(1, Arc::new(AtomicUsize::new(0)))).build();

        controller.mark_done(Some(QueryError::MissingSchema));
        controller.mark_done(None);
        controller.mark_done(Some(QueryError::MissingJobId));

        controller.done().await;
        assert!(matches!(controller.err(), Some(QueryError::MissingSchema)));
    }

    #[tokio::test]
    async fn test_done_status_with_error_fails() {
        let wait = JobStep::new(|_ctx| async {
            Ok::<_, QueryError>(Job {
                job_reference: Some(reference()),
                configuration: None,
                status: Some(JobStatus {
                    state: "DONE".into(),
                    error_result: Some(ErrorProto {
                        reason: Some("invalidQuery".into()),
                        location: None,
                        message: Some("Syntax error".into()),
                    }),
                    errors: vec![],
                }),
            })
        });
        let controller = JobController::builder(wait).build();

        let err = controller.wait(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, QueryError::JobFailed(ref e) if e.reason.as_deref() == Some("invalidQuery")));
        assert_eq!(controller.job_reference(), Some(reference()));
    }

    #[test]
    fn test_flag_overrides_status() {
        let controller = JobController::builder(complete_after(1, Arc::new(AtomicUsize::new(0)))).build();
        let complete = controller
            .apply(vec![
                CompletionSignal::Status {
                    state: "DONE".into(),
                    error: None,
                },
                CompletionSignal::Flag(false),
            ])
            .unwrap();
        assert!(!complete);
    }

    #[test]
    fn test_reference_keeps_known_location() {
        let controller = JobController::builder(complete_after(1, Arc::new(AtomicUsize::new(0))))
            .job_reference(reference())
            .build();
        controller
            .apply(vec![CompletionSignal::Reference(JobReference::new("p", "job-1"))])
            .unwrap();
        assert_eq!(controller.job_reference().unwrap().location.as_deref(), Some("US"));
    }

    #[tokio::test]
    async fn test_create_step_feeds_wait_step() {
        let create = JobStep::new(|_ctx| async {
            Ok::<_, QueryError>(vec![CompletionSignal::Reference(reference())])
        });
        let seen = Arc::new(Mutex::new(None));
        let seen_in_step = seen.clone();
        let wait = JobStep::new(move |ctx: StepContext| {
            *seen_in_step.lock().unwrap() = ctx.job_reference;
            async { Ok::<_, QueryError>(vec![CompletionSignal::Flag(true)]) }
        });

        let controller = JobController::builder(wait).create(create).build();
        controller.wait(&CancellationToken::new()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(reference()));
    }

    #[tokio::test]
    async fn test_initial_signals_complete_without_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let controller = JobController::builder(complete_after(1, calls.clone()))
            .initial(vec![CompletionSignal::Flag(true)])
            .build();

        assert!(controller.is_done());
        controller.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_wins() {
        let cancel = CancellationToken::new();
        let controller = JobController::builder(complete_after(usize::MAX, Arc::new(AtomicUsize::new(0))))
            .cancel(cancel.clone())
            .build();
        controller.start();
        controller.start();

        cancel.cancel();
        controller.done().await;
        assert!(matches!(controller.err(), Some(QueryError::Cancelled)));
        assert!(!controller.complete());
    }

    #[tokio::test]
    async fn test_caller_cancellation_returns_early() {
        let wait = JobStep::new(|_ctx| std::future::pending::<Result<Vec<CompletionSignal>, QueryError>>());
        let controller = JobController::builder(wait).build();

        let caller = CancellationToken::new();
        caller.cancel();
        let err = controller.wait(&caller).await.unwrap_err();
        assert!(err.is_cancelled());
        // the controller itself keeps running
        assert!(controller.err().is_none());
    }
}
