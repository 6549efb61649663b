use crate::config::QueueConfig;
use crate::stages::NotificationStage;
use anyhow::Result;
use aws_config::SdkConfig;
use prism_pipeline::{
    BatchEngine, CancellationToken, ChangeNotification, Keyspace, PipelineError, RecordHandler,
    S3Event,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Pause after a failed receive before polling again
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pause after a receive that returned no messages
const EMPTY_RECEIVE_DELAY: Duration = Duration::from_millis(200);

/// One message received from a notification queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// Queue delivering S3 event notifications
#[async_trait::async_trait]
pub trait MessageQueue: Send + Sync {
    /// Receive the next batch of messages, possibly empty
    async fn receive(&self) -> prism_pipeline::Result<Vec<QueueMessage>>;

    /// Acknowledge a message so it is not redelivered
    async fn delete(&self, receipt_handle: &str) -> prism_pipeline::Result<()>;
}

/// SQS queue subscribed to the bucket's event notifications
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    wait_time_secs: i32,
    max_messages: i32,
    visibility_timeout_secs: i32,
}

impl SqsQueue {
    pub fn new(sdk_config: &SdkConfig, queue_url: impl Into<String>, config: &QueueConfig) -> Self {
        Self {
            client: aws_sdk_sqs::Client::new(sdk_config),
            queue_url: queue_url.into(),
            wait_time_secs: config.wait_time_secs,
            max_messages: config.max_messages,
            visibility_timeout_secs: config.visibility_timeout_secs,
        }
    }
}

#[async_trait::async_trait]
impl MessageQueue for SqsQueue {
    async fn receive(&self) -> prism_pipeline::Result<Vec<QueueMessage>> {
        use aws_sdk_sqs::error::DisplayErrorContext;

        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(self.max_messages)
            .wait_time_seconds(self.wait_time_secs)
            .visibility_timeout(self.visibility_timeout_secs)
            .send()
            .await
            .map_err(|e| {
                PipelineError::Transport(format!(
                    "sqs receive {}: {}",
                    self.queue_url,
                    DisplayErrorContext(e)
                ))
            })?;

        Ok(output
            .messages()
            .iter()
            .filter_map(|message| {
                Some(QueueMessage {
                    message_id: message.message_id().unwrap_or_default().to_string(),
                    receipt_handle: message.receipt_handle()?.to_string(),
                    body: message.body().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    async fn delete(&self, receipt_handle: &str) -> prism_pipeline::Result<()> {
        use aws_sdk_sqs::error::DisplayErrorContext;

        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| {
                PipelineError::Transport(format!(
                    "sqs delete {}: {}",
                    self.queue_url,
                    DisplayErrorContext(e)
                ))
            })?;
        Ok(())
    }
}

/// Counts for one poll of the queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub received: usize,
    /// Messages acknowledged after every record in them succeeded
    pub deleted: usize,
    /// Messages left on the queue for redelivery
    pub retained: usize,
}

/// Feeds queued notifications for one stage through the batch engine
pub struct NotificationConsumer<H> {
    stage: NotificationStage,
    queue: Arc<dyn MessageQueue>,
    handler: Arc<H>,
    engine: BatchEngine,
    keyspace: Keyspace,
}

impl<H: RecordHandler> NotificationConsumer<H> {
    pub fn new(
        stage: NotificationStage,
        queue: Arc<dyn MessageQueue>,
        handler: Arc<H>,
        engine: BatchEngine,
        keyspace: Keyspace,
    ) -> Self {
        Self {
            stage,
            queue,
            handler,
            engine,
            keyspace,
        }
    }

    /// Start consuming until `cancel` fires
    ///
    /// Cancellation is observed between polls. Handlers of a batch in flight
    /// see it through their token, and the batch is still reduced and its
    /// successful messages acknowledged before the consumer returns.
    #[instrument(skip_all, fields(stage = %self.stage))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("Starting notification consumer");

        while !cancel.is_cancelled() {
            let pause = match self.poll_once(&cancel).await {
                Ok(stats) if stats.received == 0 => EMPTY_RECEIVE_DELAY,
                Ok(_) => continue,
                Err(e) => {
                    error!(error = %e, "Failed to receive notifications");
                    metrics::counter!("analysis.queue.errors", "stage" => self.stage.name())
                        .increment(1);
                    RECEIVE_RETRY_DELAY
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Notification consumer stopped");
        Ok(())
    }

    /// Receive one batch of messages and process it
    ///
    /// Every notification from every received message is dispatched as one
    /// batch. A message is deleted only when all of its records succeeded, so
    /// failed records are redelivered by the queue.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> prism_pipeline::Result<PollStats> {
        // Nothing is received yet, so abandoning the wait loses no message
        let messages = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PollStats::default()),
            received = self.queue.receive() => received?,
        };
        if messages.is_empty() {
            return Ok(PollStats::default());
        }

        let mut stats = PollStats {
            received: messages.len(),
            ..Default::default()
        };
        metrics::counter!("analysis.messages.received", "stage" => self.stage.name())
            .increment(messages.len() as u64);

        // Owning message of each dispatched notification
        let mut owners = Vec::new();
        let mut notifications = Vec::new();
        let mut poisoned = vec![false; messages.len()];

        for (idx, message) in messages.iter().enumerate() {
            match self.decode(message) {
                Ok(decoded) => {
                    for notification in decoded {
                        owners.push(idx);
                        notifications.push(notification);
                    }
                }
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "Undecodable notification message"
                    );
                    metrics::counter!("analysis.messages.undecodable", "stage" => self.stage.name())
                        .increment(1);
                    poisoned[idx] = true;
                }
            }
        }

        let report = self
            .engine
            .dispatch(self.handler.clone(), notifications, cancel)
            .await;

        let mut failed = poisoned;
        for outcome in &report.outcomes {
            if outcome.result.is_err() {
                failed[owners[outcome.index]] = true;
            }
        }

        match report.into_result() {
            Ok(summary) => debug!(stage = %self.stage, "{}", summary),
            Err(failure) => error!(stage = %self.stage, "{}", failure),
        }

        for (message, failed) in messages.iter().zip(failed) {
            if failed {
                stats.retained += 1;
                continue;
            }
            match self.queue.delete(&message.receipt_handle).await {
                Ok(()) => stats.deleted += 1,
                Err(e) => {
                    warn!(message_id = %message.message_id, error = %e, "Failed to delete message");
                    stats.retained += 1;
                }
            }
        }

        metrics::counter!("analysis.messages.processed", "stage" => self.stage.name())
            .increment(stats.deleted as u64);
        metrics::counter!("analysis.messages.retained", "stage" => self.stage.name())
            .increment(stats.retained as u64);

        Ok(stats)
    }

    /// Notifications in a message that belong to this stage's trigger partition
    fn decode(&self, message: &QueueMessage) -> prism_pipeline::Result<Vec<ChangeNotification>> {
        let event: S3Event = serde_json::from_str(&message.body)?;
        let trigger = self.stage.trigger();

        Ok(event
            .into_notifications()
            .into_iter()
            .filter(|notification| {
                let matches = self.keyspace.partition_of(&notification.object_key) == Some(trigger);
                if !matches {
                    debug!(key = %notification.object_key, "Ignoring notification outside trigger partition");
                }
                matches
            })
            .collect())
    }
}
