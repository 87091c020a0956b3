//! Worker pool for background loops
//!
//! Runs the outbox dispatcher, the outbox purge and the timer sweeper as
//! independent tasks with graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::outbox::{OutboxConfig, OutboxDispatcher};
use super::timer::{SweeperConfig, TimerSweeper};
use crate::reliability::duration_millis;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Outbox dispatcher settings
    pub outbox: OutboxConfig,

    /// Timer sweeper settings
    pub sweeper: SweeperConfig,

    /// Time between purges of processed outbox rows
    #[serde(with = "duration_millis")]
    pub purge_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            outbox: OutboxConfig::default(),
            sweeper: SweeperConfig::default(),
            purge_interval: Duration::from_secs(60 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_outbox(mut self, config: OutboxConfig) -> Self {
        self.outbox = config;
        self
    }

    pub fn with_sweeper(mut self, config: SweeperConfig) -> Self {
        self.sweeper = config;
        self
    }

    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Loops are running
    Running,
    /// Shutdown requested, waiting for loops to exit
    Draining,
    /// No loops are running
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// A pool is single-use once shut down
    #[error("worker pool has been shut down")]
    ShutDown,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Background loops sharing nothing but storage
///
/// Each loop iteration is its own error boundary: failures are logged and
/// the loop carries on with the next tick.
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(dispatcher, sweeper, WorkerPoolConfig::default());
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    dispatcher: Arc<OutboxDispatcher>,
    sweeper: Arc<TimerSweeper>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    status: RwLock<WorkerPoolStatus>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(dispatcher: OutboxDispatcher, sweeper: TimerSweeper, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            dispatcher: Arc::new(dispatcher),
            sweeper: Arc::new(sweeper),
            config,
            shutdown_tx,
            shutdown_rx,
            cancel: CancellationToken::new(),
            status: RwLock::new(WorkerPoolStatus::Stopped),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the background loops
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            if *self.shutdown_rx.borrow() {
                return Err(WorkerPoolError::ShutDown);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.outbox.poll_interval.as_millis() as u64,
            sweep_interval_ms = self.config.sweeper.interval.as_millis() as u64,
            "Starting worker pool"
        );

        let handles = vec![
            self.start_dispatch_loop(),
            self.start_purge_loop(),
            self.start_sweep_loop(),
        ];
        self.handles.lock().extend(handles);
        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// In-flight external calls are cancelled and recorded as timed out.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
        self.cancel.cancel();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let joined = tokio::time::timeout(
            self.config.shutdown_timeout,
            futures::future::join_all(handles),
        )
        .await;

        *self.status.write() = WorkerPoolStatus::Stopped;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Background loop panicked: {}", e);
                    }
                }
                info!(worker_id = %self.config.worker_id, "Worker pool stopped");
                Ok(())
            }
            Err(_) => {
                warn!("Shutdown timeout reached");
                Err(WorkerPoolError::ShutdownTimeout)
            }
        }
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Start the outbox dispatch loop
    fn start_dispatch_loop(&self) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let interval = self.config.outbox.poll_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = dispatcher.run_once().await {
                            error!("Outbox dispatch failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Dispatch loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Dispatch loop exited");
        })
    }

    /// Start the processed-outbox purge loop
    fn start_purge_loop(&self) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let interval = self.config.purge_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = dispatcher.purge_processed().await {
                            error!("Outbox purge failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Purge loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Purge loop exited");
        })
    }

    /// Start the timer sweep loop
    fn start_sweep_loop(&self) -> JoinHandle<()> {
        let sweeper = Arc::clone(&self.sweeper);
        let interval = self.config.sweeper.interval;
        let cancel = self.cancel.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sweeper.tick(&cancel).await {
                            error!("Timer sweep failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Sweep loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Sweep loop exited");
        })
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_id", &self.config.worker_id)
            .field("status", &self.status())
            .finish()
    }
}
