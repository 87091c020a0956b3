//! Outbox dispatcher
//!
//! Polls pending outbox rows, routes each one to the handler registered for
//! its [`OutboxEventType`] and records the result with a conditional update,
//! so two dispatchers racing on the same row cannot both mark it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::model::{before_now, BookmarkType, OutboxEventType, OutboxMessage, OutboxStatus};
use crate::persistence::{IsolationLevel, StoreError, TransactionGateway};
use crate::reliability::duration_millis;
use crate::service::{EventPublisher, PublishError};

/// Outbox dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Rows fetched per poll
    pub batch_size: usize,

    /// Time between polls
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Failed deliveries before a row is dead-lettered
    pub max_attempts: u32,

    /// How long processed rows are kept
    #[serde(with = "duration_millis")]
    pub retention: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_secs(5),
            max_attempts: 5,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl OutboxConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Delivers one outbox message
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    async fn handle(
        &self,
        event_type: OutboxEventType,
        message: &OutboxMessage,
    ) -> Result<(), PublishError>;
}

/// Handler that turns outbox payloads into [`EventPublisher`] calls
pub struct PublisherOutboxHandler {
    publisher: Arc<dyn EventPublisher>,
}

impl PublisherOutboxHandler {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }
}

impl std::fmt::Debug for PublisherOutboxHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherOutboxHandler").finish_non_exhaustive()
    }
}

fn text<'a>(message: &'a OutboxMessage, field: &str) -> Option<&'a str> {
    message.payload.get(field).and_then(Value::as_str)
}

fn required<'a>(message: &'a OutboxMessage, field: &str) -> Result<&'a str, PublishError> {
    text(message, field)
        .ok_or_else(|| PublishError::Malformed(format!("payload is missing '{field}'")))
}

fn timestamp(message: &OutboxMessage, field: &str) -> Result<DateTime<Utc>, PublishError> {
    required(message, field)?
        .parse::<DateTime<Utc>>()
        .map_err(|e| PublishError::Malformed(format!("'{field}' is not a timestamp: {e}")))
}

fn activity_id(message: &OutboxMessage) -> Result<&str, PublishError> {
    message
        .activity_id
        .as_deref()
        .or_else(|| text(message, "ActivityId"))
        .ok_or_else(|| PublishError::Malformed("payload is missing 'ActivityId'".into()))
}

#[async_trait]
impl OutboxHandler for PublisherOutboxHandler {
    async fn handle(
        &self,
        event_type: OutboxEventType,
        message: &OutboxMessage,
    ) -> Result<(), PublishError> {
        let instance_id = message.instance_id;
        let correlation_id = message.correlation_id.as_deref();

        match event_type {
            OutboxEventType::WorkflowStarted => {
                self.publisher
                    .workflow_started(
                        instance_id,
                        text(message, "WorkflowName").unwrap_or_default(),
                        text(message, "StartedBy").unwrap_or_default(),
                        correlation_id,
                    )
                    .await
            }
            OutboxEventType::WorkflowCompleted => {
                let completed_at = match text(message, "CompletedAt") {
                    Some(_) => timestamp(message, "CompletedAt")?,
                    None => message.created_at,
                };
                self.publisher
                    .workflow_completed(instance_id, completed_at, correlation_id)
                    .await
            }
            OutboxEventType::WorkflowFailed => {
                self.publisher
                    .workflow_failed(
                        instance_id,
                        text(message, "Error").unwrap_or("unknown error"),
                        correlation_id,
                    )
                    .await
            }
            OutboxEventType::WorkflowCancelled => {
                self.publisher
                    .workflow_cancelled(
                        instance_id,
                        text(message, "Reason").unwrap_or_default(),
                        text(message, "CancelledBy").unwrap_or_default(),
                        correlation_id,
                    )
                    .await
            }
            OutboxEventType::ActivityCompleted => {
                self.publisher
                    .activity_completed(instance_id, activity_id(message)?, correlation_id)
                    .await
            }
            OutboxEventType::TimerExpired
            | OutboxEventType::UserActionTimeout
            | OutboxEventType::ExternalMessageTimeout => {
                let bookmark_type = match event_type {
                    OutboxEventType::TimerExpired => BookmarkType::Timer,
                    OutboxEventType::UserActionTimeout => BookmarkType::UserAction,
                    _ => BookmarkType::ExternalMessage,
                };
                self.publisher
                    .bookmark_timed_out(
                        instance_id,
                        activity_id(message)?,
                        required(message, "BookmarkKey")?,
                        bookmark_type,
                        timestamp(message, "ExpiredAt")?,
                        correlation_id,
                    )
                    .await
            }
            OutboxEventType::WorkflowTimeoutWarning => {
                self.publisher
                    .workflow_timeout_warning(
                        instance_id,
                        timestamp(message, "RunningSince")?,
                        correlation_id,
                    )
                    .await
            }
        }
    }
}

/// What happened to one message in a dispatch pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Processed,
    /// Delivery failed; the row stays pending for another pass
    Failed,
    DeadLettered,
    /// Another dispatcher recorded a result first
    Skipped,
}

/// Totals of one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub processed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Processed => self.processed += 1,
            DeliveryOutcome::Failed => self.failed += 1,
            DeliveryOutcome::DeadLettered => self.dead_lettered += 1,
            DeliveryOutcome::Skipped => self.skipped += 1,
        }
    }

    /// Number of rows looked at
    pub fn total(&self) -> usize {
        self.processed + self.failed + self.dead_lettered + self.skipped
    }
}

/// Background delivery of outbox messages
///
/// # Example
///
/// ```ignore
/// let dispatcher = OutboxDispatcher::new(gateway, OutboxConfig::default())
///     .with_publisher(Arc::new(TracingEventPublisher));
/// let report = dispatcher.run_once().await?;
/// ```
pub struct OutboxDispatcher {
    gateway: TransactionGateway,
    handlers: HashMap<OutboxEventType, Arc<dyn OutboxHandler>>,
    config: OutboxConfig,
}

impl OutboxDispatcher {
    /// Create a dispatcher with no handlers
    pub fn new(gateway: TransactionGateway, config: OutboxConfig) -> Self {
        Self {
            gateway,
            handlers: HashMap::new(),
            config,
        }
    }

    /// Route every event type to `publisher`
    pub fn with_publisher(self, publisher: Arc<dyn EventPublisher>) -> Self {
        let handler: Arc<dyn OutboxHandler> = Arc::new(PublisherOutboxHandler::new(publisher));
        OutboxEventType::ALL
            .iter()
            .fold(self, |dispatcher, event_type| {
                dispatcher.with_handler(*event_type, Arc::clone(&handler))
            })
    }

    /// Route one event type to `handler`, replacing any previous handler
    pub fn with_handler(mut self, event_type: OutboxEventType, handler: Arc<dyn OutboxHandler>) -> Self {
        self.handlers.insert(event_type, handler);
        self
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Deliver one batch of pending messages
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<DispatchReport, StoreError> {
        let limit = self.config.batch_size;
        let batch = self
            .gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.list_pending_outbox(limit).await })
            })
            .await?;

        let mut report = DispatchReport::default();
        for message in batch {
            report.record(self.deliver(message).await?);
        }

        if report.total() > 0 {
            debug!(
                processed = report.processed,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "outbox batch dispatched"
            );
        }
        Ok(report)
    }

    async fn deliver(&self, message: OutboxMessage) -> Result<DeliveryOutcome, StoreError> {
        let delivered = match message.event_type.parse::<OutboxEventType>() {
            Ok(event_type) => match self.handlers.get(&event_type) {
                Some(handler) => handler
                    .handle(event_type, &message)
                    .await
                    .map_err(|e| e.to_string()),
                None => Err(format!("no handler registered for '{event_type}'")),
            },
            Err(e) => Err(e.to_string()),
        };

        let read_attempts = message.attempt_count;
        let mut updated = message;
        let outcome = match delivered {
            Ok(()) => {
                updated.status = OutboxStatus::Processed;
                updated.processed_at = Some(Utc::now());
                DeliveryOutcome::Processed
            }
            Err(error) => {
                updated.attempt_count += 1;
                if updated.attempt_count >= self.config.max_attempts {
                    updated.status = OutboxStatus::DeadLetter;
                    warn!(
                        message_id = %updated.id,
                        event_type = %updated.event_type,
                        attempts = updated.attempt_count,
                        error = %error,
                        "outbox message dead-lettered"
                    );
                    updated.last_error = Some(error);
                    DeliveryOutcome::DeadLettered
                } else {
                    debug!(
                        message_id = %updated.id,
                        attempts = updated.attempt_count,
                        error = %error,
                        "outbox delivery failed"
                    );
                    updated.last_error = Some(error);
                    DeliveryOutcome::Failed
                }
            }
        };

        let written = self
            .gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let updated = updated.clone();
                Box::pin(async move { tx.update_outbox(&updated, OutboxStatus::Pending, read_attempts).await })
            })
            .await?;

        Ok(if written { outcome } else { DeliveryOutcome::Skipped })
    }

    /// Delete processed rows older than the retention window
    pub async fn purge_processed(&self) -> Result<u64, StoreError> {
        let cutoff = before_now(self.config.retention);
        let purged = self
            .gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.delete_processed_outbox(cutoff).await })
            })
            .await?;

        if purged > 0 {
            info!(purged, "purged processed outbox messages");
        }
        Ok(purged)
    }

    /// Queue a message outside any workflow step
    pub async fn enqueue(&self, message: OutboxMessage) -> Result<Uuid, StoreError> {
        let id = message.id;
        self.gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                let message = message.clone();
                Box::pin(async move { tx.enqueue_outbox(&message).await })
            })
            .await?;
        Ok(id)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl std::fmt::Debug for OutboxDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxDispatcher")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}
