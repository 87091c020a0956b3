//! Timer sweeper
//!
//! Each tick expires due timer bookmarks and warns about instances that have
//! been running for too long. It then times out external calls stuck in
//! `Started`, re-drives failed ones whose backoff has elapsed and purges old
//! consumed bookmarks.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bookmark::BookmarkStore;
use crate::external_call::{ExternalCallGateway, ExternalCallOutcome};
use crate::model::{
    before_now, ExecutionLogEntry, LogEventKind, OutboxEventType, OutboxMessage, WorkflowBookmark,
    WorkflowInstance,
};
use crate::persistence::{
    IsolationLevel, LockMode, StoreError, TransactionGateway, WorkflowTransaction,
};
use crate::reliability::duration_millis;

/// Actor recorded on bookmarks the sweeper consumes
pub const TIMER_SWEEPER_ACTOR: &str = "system:timer-sweeper";

/// Timer sweeper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Time between ticks
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Rows handled per stage per tick
    pub batch_size: usize,

    /// Running time after which an instance gets a timeout warning
    #[serde(with = "duration_millis")]
    pub instance_ceiling: Duration,

    /// How long consumed bookmarks are kept
    #[serde(with = "duration_millis")]
    pub bookmark_retention: Duration,

    /// Wait for the per-bookmark application lock
    #[serde(with = "duration_millis")]
    pub lock_timeout: Duration,

    /// Attempt budget for re-driven external calls
    pub external_call_max_attempts: u32,

    /// Age after which a `Started` call without a result is timed out
    #[serde(with = "duration_millis")]
    pub stale_call_after: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 100,
            instance_ceiling: Duration::from_secs(24 * 60 * 60),
            bookmark_retention: Duration::from_secs(30 * 24 * 60 * 60),
            lock_timeout: Duration::from_secs(5),
            external_call_max_attempts: 5,
            stale_call_after: Duration::from_secs(5 * 60),
        }
    }
}

impl SweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_instance_ceiling(mut self, ceiling: Duration) -> Self {
        self.instance_ceiling = ceiling;
        self
    }

    pub fn with_bookmark_retention(mut self, retention: Duration) -> Self {
        self.bookmark_retention = retention;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_external_call_max_attempts(mut self, max_attempts: u32) -> Self {
        self.external_call_max_attempts = max_attempts;
        self
    }

    /// Should exceed the external call timeout
    pub fn with_stale_call_after(mut self, stale_after: Duration) -> Self {
        self.stale_call_after = stale_after;
        self
    }
}

/// Totals of one sweeper tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timers_expired: usize,
    pub timeout_warnings: usize,
    pub calls_reclaimed: usize,
    pub calls_retried: usize,
    pub bookmarks_purged: u64,
}

/// Periodic maintenance over bookmarks, instances and external calls
pub struct TimerSweeper {
    gateway: TransactionGateway,
    bookmarks: BookmarkStore,
    external_calls: Option<ExternalCallGateway>,
    config: SweeperConfig,
}

impl TimerSweeper {
    pub fn new(gateway: TransactionGateway, config: SweeperConfig) -> Self {
        Self {
            bookmarks: BookmarkStore::new(gateway.clone()),
            gateway,
            external_calls: None,
            config,
        }
    }

    /// Re-drive retryable calls through `external_calls`
    pub fn with_external_calls(mut self, external_calls: ExternalCallGateway) -> Self {
        self.external_calls = Some(external_calls);
        self
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Run every stage once
    #[instrument(skip(self, cancel))]
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<SweepReport, StoreError> {
        let report = SweepReport {
            timers_expired: self.expire_due_timers().await?,
            timeout_warnings: self.warn_long_running().await?,
            calls_reclaimed: self.reclaim_stale_calls().await?,
            calls_retried: self.retry_external_calls(cancel).await?,
            bookmarks_purged: self.bookmarks.cleanup_expired(self.config.bookmark_retention).await?,
        };

        if report != SweepReport::default() {
            debug!(
                timers_expired = report.timers_expired,
                timeout_warnings = report.timeout_warnings,
                calls_reclaimed = report.calls_reclaimed,
                calls_retried = report.calls_retried,
                bookmarks_purged = report.bookmarks_purged,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Consume due timers and queue their timeout events
    ///
    /// Timers of closed or deleted instances are consumed without an event.
    pub async fn expire_due_timers(&self) -> Result<usize, StoreError> {
        let due = self
            .bookmarks
            .get_due_timer_bookmarks(Utc::now(), self.config.batch_size)
            .await?;

        let mut expired = 0;
        for bookmark in due {
            let bookmark_id = bookmark.id;
            let lock_timeout = self.config.lock_timeout;
            let consumed = self
                .gateway
                .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                    Box::pin(async move { Self::expire_timer_in(tx, bookmark_id, lock_timeout).await })
                })
                .await?;

            if let Some(bookmark) = consumed {
                info!(
                    instance_id = %bookmark.instance_id,
                    activity_id = %bookmark.activity_id,
                    key = %bookmark.key,
                    "timer expired"
                );
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn expire_timer_in(
        tx: &mut dyn WorkflowTransaction,
        bookmark_id: Uuid,
        lock_timeout: Duration,
    ) -> Result<Option<WorkflowBookmark>, StoreError> {
        let resource = format!("bookmark:{bookmark_id}");
        let lock = tx
            .acquire_application_lock(&resource, LockMode::Exclusive, lock_timeout)
            .await?;
        if !lock.is_granted() {
            debug!(%bookmark_id, ?lock, "bookmark lock not granted, skipping");
            return Ok(None);
        }

        let Some(bookmark) =
            BookmarkStore::consume_timer_in(tx, bookmark_id, TIMER_SWEEPER_ACTOR).await?
        else {
            return Ok(None);
        };

        let open = tx
            .get_instance(bookmark.instance_id)
            .await?
            .is_some_and(|instance| !instance.status.is_terminal());
        if !open {
            debug!(%bookmark_id, instance_id = %bookmark.instance_id, "timer of closed instance dropped");
            return Ok(None);
        }

        let message = OutboxMessage::new(
            OutboxEventType::timeout_for(bookmark.bookmark_type),
            bookmark.instance_id,
            Some(bookmark.activity_id.clone()),
            json!({
                "BookmarkId": bookmark.id,
                "BookmarkKey": bookmark.key,
                "ExpiredAt": Utc::now(),
            }),
        )
        .with_correlation_id(bookmark.correlation_id.clone());
        tx.enqueue_outbox(&message).await?;

        Ok(Some(bookmark))
    }

    /// Queue one timeout warning per instance running past the ceiling
    ///
    /// The execution log records each warning, so purging delivered outbox
    /// rows does not re-arm it. Instances are never cancelled here.
    pub async fn warn_long_running(&self) -> Result<usize, StoreError> {
        let started_before = before_now(self.config.instance_ceiling);
        let limit = self.config.batch_size;
        let instances = self
            .gateway
            .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                Box::pin(async move { tx.list_long_running_instances(started_before, limit).await })
            })
            .await?;

        let mut warned = 0;
        for instance in instances {
            let queued = self
                .gateway
                .run_in_transaction(IsolationLevel::ReadCommitted, move |tx| {
                    let instance = instance.clone();
                    Box::pin(async move { Self::warn_in(tx, &instance).await })
                })
                .await?;
            if queued {
                warned += 1;
            }
        }
        Ok(warned)
    }

    async fn warn_in(
        tx: &mut dyn WorkflowTransaction,
        instance: &WorkflowInstance,
    ) -> Result<bool, StoreError> {
        if tx
            .count_logs(instance.id, LogEventKind::TimeoutWarning, instance.started_at)
            .await?
            > 0
        {
            return Ok(false);
        }

        let message = OutboxMessage::new(
            OutboxEventType::WorkflowTimeoutWarning,
            instance.id,
            instance.current_activity_id.clone(),
            json!({
                "WorkflowName": instance.name,
                "RunningSince": instance.started_at,
            }),
        )
        .with_correlation_id(instance.correlation_id.clone());
        tx.enqueue_outbox(&message).await?;
        tx.append_log(
            &ExecutionLogEntry::new(
                instance.id,
                LogEventKind::TimeoutWarning,
                "workflow running past its ceiling",
            )
            .with_metadata(json!({ "OutboxMessageId": message.id })),
        )
        .await?;

        warn!(instance_id = %instance.id, started_at = %instance.started_at, "workflow running past its ceiling");
        Ok(true)
    }

    /// Time out calls claimed longer than `stale_call_after` ago
    pub async fn reclaim_stale_calls(&self) -> Result<usize, StoreError> {
        let Some(external_calls) = &self.external_calls else {
            return Ok(0);
        };
        external_calls
            .reclaim_stale_calls(self.config.stale_call_after, self.config.batch_size)
            .await
    }

    /// Re-drive failed or timed-out calls whose backoff has elapsed
    pub async fn retry_external_calls(&self, cancel: &CancellationToken) -> Result<usize, StoreError> {
        let Some(external_calls) = &self.external_calls else {
            return Ok(0);
        };

        let max_attempts = self.config.external_call_max_attempts;
        let now = Utc::now();
        let candidates = external_calls
            .get_retryable_calls(max_attempts, self.config.batch_size)
            .await?;

        let mut retried = 0;
        for call in candidates
            .into_iter()
            .filter(|call| external_calls.is_retry_due(call, now))
        {
            if cancel.is_cancelled() {
                break;
            }
            match external_calls.retry(call.id, max_attempts, cancel).await? {
                ExternalCallOutcome::Rejected { .. } | ExternalCallOutcome::NotFound(_) => {}
                outcome => {
                    debug!(call_id = %call.id, success = outcome.is_success(), "external call re-driven");
                    retried += 1;
                }
            }
        }
        Ok(retried)
    }
}

impl std::fmt::Debug for TimerSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerSweeper")
            .field("config", &self.config)
            .field("external_calls", &self.external_calls.is_some())
            .finish()
    }
}
