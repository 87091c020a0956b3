//! Background workers
//!
//! This module provides:
//! - [`OutboxDispatcher`] - Delivers pending outbox messages, dead-letters what keeps failing
//! - [`TimerSweeper`] - Expires due timers, warns about long-running instances, re-drives external calls
//! - [`WorkerPool`] - Runs both as independent loops with graceful shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌──────────────────┐  ┌─────────────┐  ┌────────────────┐  │
//! │  │ OutboxDispatcher │  │ Outbox purge│  │  TimerSweeper  │  │
//! │  │      (5s)        │  │    (1h)     │  │     (30s)      │  │
//! │  └────────┬─────────┘  └──────┬──────┘  └───────┬────────┘  │
//! └───────────┼───────────────────┼─────────────────┼───────────┘
//!             ▼                   ▼                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowStore                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use flowcore::worker::{OutboxDispatcher, TimerSweeper, WorkerPool, WorkerPoolConfig};
//!
//! let config = WorkerPoolConfig::default().with_worker_id("flowcore-worker-1");
//! let dispatcher = OutboxDispatcher::new(gateway.clone(), config.outbox.clone())
//!     .with_publisher(Arc::new(TracingEventPublisher));
//! let sweeper = TimerSweeper::new(gateway, config.sweeper.clone());
//!
//! let pool = WorkerPool::new(dispatcher, sweeper, config);
//! pool.start()?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod outbox;
mod pool;
mod timer;

pub use outbox::{
    DeliveryOutcome, DispatchReport, OutboxConfig, OutboxDispatcher, OutboxHandler,
    PublisherOutboxHandler,
};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use timer::{SweepReport, SweeperConfig, TimerSweeper, TIMER_SWEEPER_ACTOR};
