//! Batch fan-out/aggregate engine.
//!
//! A batch of change notifications is dispatched to a record handler with one
//! task per notification. The engine waits for every task (no early exit on
//! the first failure), collects one outcome per notification and reduces the
//! set into either a success count or a single failure that lists every
//! individual error.
//!
//! ```text
//!              ┌──────────┐
//!          ┌──▶│ record 0 │──┐
//! batch ───┼──▶│ record 1 │──┼──▶ join all ──▶ BatchReport ──▶ Ok(BatchSummary)
//!          └──▶│ record 2 │──┘                              └─▶ Err(BatchFailure)
//!              └──────────┘
//! ```
//!
//! Fan-out can be bounded with a semaphore and every record can be given a
//! deadline, see [`BatchConfig`].

use crate::config::BatchConfig;
use crate::error::PipelineError;
use crate::notification::ChangeNotification;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handler invoked once per notification in a batch
///
/// Handlers must be idempotent: a failed batch is redelivered as a whole by
/// the notification source.
#[async_trait::async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Process a single notification
    async fn handle(
        &self,
        cancel: CancellationToken,
        notification: ChangeNotification,
    ) -> Result<Self::Output, PipelineError>;
}

/// Function-based record handler
pub struct FnHandler<F> {
    handler: F,
}

impl<F> FnHandler<F> {
    pub fn new<Fut, T>(handler: F) -> Self
    where
        F: Fn(CancellationToken, ChangeNotification) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        Self { handler }
    }
}

#[async_trait::async_trait]
impl<F, Fut, T> RecordHandler for FnHandler<F>
where
    F: Fn(CancellationToken, ChangeNotification) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    async fn handle(
        &self,
        cancel: CancellationToken,
        notification: ChangeNotification,
    ) -> Result<T, PipelineError> {
        (self.handler)(cancel, notification).await
    }
}

/// Outcome of a single dispatched notification
#[derive(Debug)]
pub struct RecordOutcome<T> {
    /// Position of the notification in the batch
    pub index: usize,
    pub notification: ChangeNotification,
    pub result: Result<T, PipelineError>,
}

/// A notification that failed, with its error
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    pub notification: ChangeNotification,
    pub error: PipelineError,
}

/// Success summary for a batch with no failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Processed {} events", self.processed)
    }
}

/// Combined failure for a batch with at least one failed record
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    /// Records that completed successfully alongside the failures
    pub succeeded: usize,
    /// Every failed record, in batch order
    pub failures: Vec<RecordFailure>,
}

impl BatchFailure {
    pub fn total(&self) -> usize {
        self.succeeded + self.failures.len()
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to process {} of {} records:",
            self.failures.len(),
            self.total()
        )?;
        for failure in &self.failures {
            write!(
                f,
                " [s3://{}/{}: {}]",
                failure.notification.bucket_name, failure.notification.object_key, failure.error
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchFailure {}

/// Every outcome of one batch, in batch order
#[derive(Debug)]
pub struct BatchReport<T> {
    pub outcomes: Vec<RecordOutcome<T>>,
}

impl<T> BatchReport<T> {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Reduce into a success count or one failure listing every error
    pub fn into_result(self) -> Result<BatchSummary, BatchFailure> {
        let mut succeeded = 0;
        let mut failures = Vec::new();

        for outcome in self.outcomes {
            match outcome.result {
                Ok(_) => succeeded += 1,
                Err(error) => failures.push(RecordFailure {
                    notification: outcome.notification,
                    error,
                }),
            }
        }

        if failures.is_empty() {
            Ok(BatchSummary {
                processed: succeeded,
            })
        } else {
            Err(BatchFailure {
                succeeded,
                failures,
            })
        }
    }
}

/// Dispatches batches of notifications to a record handler
#[derive(Debug, Clone, Default)]
pub struct BatchEngine {
    config: BatchConfig,
}

impl BatchEngine {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Dispatch and reduce a batch
    pub async fn run<H: RecordHandler>(
        &self,
        handler: Arc<H>,
        notifications: Vec<ChangeNotification>,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, BatchFailure> {
        self.dispatch(handler, notifications, cancel)
            .await
            .into_result()
    }

    /// Dispatch every notification and wait for all of them
    ///
    /// Returns exactly one outcome per notification, ordered by position in
    /// the batch.
    #[instrument(skip_all, fields(records = notifications.len()))]
    pub async fn dispatch<H: RecordHandler>(
        &self,
        handler: Arc<H>,
        notifications: Vec<ChangeNotification>,
        cancel: &CancellationToken,
    ) -> BatchReport<H::Output> {
        let total = notifications.len();
        if total == 0 {
            debug!("Empty batch");
            return BatchReport {
                outcomes: Vec::new(),
            };
        }

        let started_at = Instant::now();
        let semaphore = self
            .config
            .concurrency_limit()
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let deadline = self.config.record_timeout();

        let mut pending: Vec<Option<ChangeNotification>> = Vec::with_capacity(total);
        let mut tasks = JoinSet::new();

        for (index, notification) in notifications.into_iter().enumerate() {
            pending.push(Some(notification.clone()));

            let handler = handler.clone();
            let semaphore = semaphore.clone();
            let record_cancel = cancel.child_token();

            tasks.spawn(async move {
                let result =
                    run_record(handler, notification.clone(), semaphore, deadline, record_cancel)
                        .await;
                RecordOutcome {
                    index,
                    notification,
                    result,
                }
            });
        }

        debug!(records = total, "Waiting for records");

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    pending[outcome.index] = None;
                    record_telemetry(&outcome);
                    outcomes.push(outcome);
                }
                Err(e) => warn!(error = %e, "Record task did not complete"),
            }
        }

        // Tasks torn down by the runtime still owe an outcome
        for (index, notification) in pending.into_iter().enumerate() {
            if let Some(notification) = notification {
                let outcome = RecordOutcome {
                    index,
                    notification,
                    result: Err(PipelineError::Cancelled),
                };
                record_telemetry(&outcome);
                outcomes.push(outcome);
            }
        }

        outcomes.sort_by_key(|o| o.index);
        let report = BatchReport { outcomes };

        let elapsed = started_at.elapsed();
        metrics::histogram!("pipeline.batch.duration_seconds").record(elapsed.as_secs_f64());
        metrics::counter!("pipeline.batches.completed").increment(1);

        info!(
            records = total,
            succeeded = report.succeeded(),
            failed = report.failed(),
            duration_ms = elapsed.as_millis() as u64,
            "Batch complete"
        );

        report
    }
}

/// Run one record under the concurrency limit and deadline
async fn run_record<H: RecordHandler>(
    handler: Arc<H>,
    notification: ChangeNotification,
    semaphore: Option<Arc<Semaphore>>,
    deadline: Option<Duration>,
    cancel: CancellationToken,
) -> Result<H::Output, PipelineError> {
    let _permit = match semaphore {
        Some(semaphore) => {
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit.map_err(|_| PipelineError::Cancelled)?,
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            };
            Some(permit)
        }
        None => None,
    };

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let mut task = AbortOnDrop(tokio::spawn({
        let cancel = cancel.clone();
        async move { handler.handle(cancel, notification).await }
    }));

    let joined = match deadline {
        Some(limit) => match tokio::time::timeout(limit, &mut task.0).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.cancel();
                return Err(PipelineError::Timeout(limit));
            }
        },
        None => (&mut task.0).await,
    };

    joined.map_err(|e| PipelineError::HandlerPanicked(panic_message(e)))?
}

/// Handler task that is aborted together with the record task owning it
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(error: JoinError) -> String {
    if error.is_cancelled() {
        return "task aborted".to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn record_telemetry<T>(outcome: &RecordOutcome<T>) {
    match &outcome.result {
        Ok(_) => {
            metrics::counter!("pipeline.records.succeeded").increment(1);
            info!(
                index = outcome.index,
                bucket = %outcome.notification.bucket_name,
                key = %outcome.notification.object_key,
                "Record complete"
            );
        }
        Err(error) => {
            metrics::counter!("pipeline.records.failed").increment(1);
            warn!(
                index = outcome.index,
                bucket = %outcome.notification.bucket_name,
                key = %outcome.notification.object_key,
                error = %error,
                "Record failed"
            );
        }
    }
}
