use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::retry::{RetryAttempt, RetryDecision, RetryPolicy, RetryTracker};
use common::{DlqEnvelope, DlqErrorCode, IngestionTask};
use mq::{BroccoliError, BrokerMessage, Mq, publish_json};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dlq::DlqService;
use crate::error::DepotError;
use crate::ingest::Ingestor;

/// How a delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    /// Dropped without requeue and recorded in the dead-letter store.
    DeadLettered(DlqErrorCode),
    /// Shutdown interrupted processing; the message should be redelivered.
    Interrupted,
}

/// Processes ingestion tasks one at a time.
pub struct IngestConsumer {
    ingestor: Arc<Ingestor>,
    /// `None` skips publishing dead letters to the broker; they are still persisted.
    mq: Option<Arc<Mq>>,
    dlq_queue_name: String,
}

impl IngestConsumer {
    pub fn new(ingestor: Arc<Ingestor>, mq: Option<Arc<Mq>>, dlq_queue_name: impl Into<String>) -> Self {
        Self {
            ingestor,
            mq,
            dlq_queue_name: dlq_queue_name.into(),
        }
    }

    /// Run one delivery to completion: retry the whole pipeline on failure, then
    /// dead-letter. Removes the staged file unless interrupted.
    pub async fn handle(
        &self,
        message_id: &str,
        payload: serde_json::Value,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome {
        let task: IngestionTask = match serde_json::from_value(payload.clone()) {
            Ok(task) => task,
            Err(e) => {
                error!(message_id, error = %e, "Failed to parse ingestion task, dropping");
                let user_identity = payload
                    .get("user_identity")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let staged = payload
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);

                let envelope = DlqEnvelope {
                    message_id: message_id.to_string(),
                    message_type: IngestionTask::MESSAGE_TYPE.to_string(),
                    user_identity,
                    payload,
                    error_code: DlqErrorCode::DeserializationError,
                    error_message: format!("Failed to parse IngestionTask: {e}"),
                    retry_history: vec![],
                };
                self.dead_letter(&envelope).await;
                if let Some(path) = staged {
                    remove_staged(Path::new(&path)).await;
                }
                return DeliveryOutcome::DeadLettered(DlqErrorCode::DeserializationError);
            }
        };

        let config = self.ingestor.config();
        let mut tracker = RetryTracker::new(RetryPolicy::fixed(
            config.max_attempts,
            Duration::from_millis(config.retry_delay_ms),
        ));

        let outcome = loop {
            match self.ingestor.run_pipeline(&task, cancel).await {
                Ok(result) => {
                    info!(
                        message_id,
                        content_ref = %result.content_ref,
                        uploaded = result.uploaded,
                        "Ingestion task completed"
                    );
                    break DeliveryOutcome::Completed;
                }
                Err(DepotError::Cancelled) => {
                    warn!(message_id, "Ingestion task interrupted by shutdown");
                    return DeliveryOutcome::Interrupted;
                }
                Err(e) => match tracker.record_failure(e.to_string()) {
                    RetryDecision::Retry { attempt, delay } => {
                        warn!(
                            message_id,
                            attempt,
                            transient = e.is_transient(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retrying ingestion task"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return DeliveryOutcome::Interrupted,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    RetryDecision::Exhausted { history } => {
                        error!(
                            message_id,
                            content_ref = %task.repository_identity,
                            retry_count = history.len(),
                            error = %e,
                            "Ingestion task failed fatally, rejecting without requeue"
                        );
                        self.dead_letter(&exhausted_envelope(message_id, &task, &e, history))
                            .await;
                        break DeliveryOutcome::DeadLettered(DlqErrorCode::MaxRetriesExceeded);
                    }
                },
            }
        };

        remove_staged(Path::new(&task.file_path)).await;
        outcome
    }

    /// Persist, then publish. Neither failure stops the consumer.
    async fn dead_letter(&self, envelope: &DlqEnvelope) {
        if let Err(e) = DlqService::new(self.ingestor.db()).send_to_dlq(envelope).await {
            error!(
                message_id = %envelope.message_id,
                error = %e,
                "Failed to persist dead letter"
            );
        }

        if let Some(mq) = &self.mq
            && let Err(e) = publish_json(mq, &self.dlq_queue_name, envelope).await
        {
            error!(error = %e, "Failed to publish to DLQ queue");
        }
    }
}

fn exhausted_envelope(
    message_id: &str,
    task: &IngestionTask,
    error: &DepotError,
    history: Vec<RetryAttempt>,
) -> DlqEnvelope {
    DlqEnvelope {
        message_id: message_id.to_string(),
        message_type: IngestionTask::MESSAGE_TYPE.to_string(),
        user_identity: Some(task.user_identity.clone()),
        payload: serde_json::to_value(task).unwrap_or_default(),
        error_code: DlqErrorCode::MaxRetriesExceeded,
        error_message: error.to_string(),
        retry_history: history,
    }
}

async fn remove_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staged upload"),
    }
}

/// Consume the ingestion queue sequentially until the broker connection ends.
pub async fn consume_ingestion_tasks(
    consumer: Arc<IngestConsumer>,
    mq: Arc<Mq>,
    queue_name: String,
    cancel: CancellationToken,
) {
    info!(queue = %queue_name, "Starting ingestion consumer");

    let result = mq
        .process_messages(
            &queue_name,
            None, // one task at a time
            None,
            move |message: BrokerMessage<serde_json::Value>| {
                let consumer = Arc::clone(&consumer);
                let cancel = cancel.clone();
                async move {
                    let message_id = message.task_id.to_string();
                    match consumer.handle(&message_id, message.payload, &cancel).await {
                        DeliveryOutcome::Interrupted => Err(BroccoliError::Job(format!(
                            "ingestion task {message_id} interrupted"
                        ))),
                        DeliveryOutcome::Completed | DeliveryOutcome::DeadLettered(_) => Ok(()),
                    }
                }
            },
        )
        .await;

    if let Err(e) = result {
        error!(error = %e, "Ingestion consumer stopped unexpectedly");
    }
}
