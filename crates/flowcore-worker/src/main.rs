use std::sync::Arc;

use anyhow::{Context, Result};
use flowcore::persistence::{migrate, PostgresWorkflowStore};
use flowcore::service::TracingEventPublisher;
use flowcore::FlowcoreConfig;
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded .env from {:?}", path);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowcore=debug,flowcore_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("flowcore-worker starting...");

    let config = FlowcoreConfig::from_env();
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL not set")?;

    let pool = PgPool::connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    migrate(&pool).await.context("Failed to run migrations")?;
    tracing::info!("Connected to database");

    let gateway = config.transaction_gateway(Arc::new(PostgresWorkflowStore::new(pool)));
    let workers = config.worker_pool(gateway, Arc::new(TracingEventPublisher));
    workers.start()?;
    tracing::info!(worker_id = %workers.worker_id(), "Worker ready, waiting for shutdown signal...");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    workers.shutdown().await?;
    tracing::info!("Worker shutdown complete");
    Ok(())
}
