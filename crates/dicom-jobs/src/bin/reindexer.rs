//! Extended query tag reindex worker.
//!
//! Connects to PostgreSQL and runs every reindex operation that still has
//! processing tags, including ones prepared by the web layer after startup,
//! until interrupted with Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dicom_db::{log_pool_metrics, Database, PoolConfig};
use dicom_jobs::{
    FilesystemMetadataStore, ReindexConfig, ReindexStores, WorkerBuilder, WorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "dicom_jobs=info,dicom_db=info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let metadata_path =
        std::env::var("DICOM_METADATA_PATH").context("DICOM_METADATA_PATH must be set")?;

    let reindex_config = ReindexConfig::from_env();
    let pool_config = PoolConfig::from_env(reindex_config.max_parallel_instances);
    let db = Database::connect_with_config(&database_url, pool_config)
        .await
        .context("failed to connect to database")?;
    info!(
        subsystem = "jobs",
        component = "main",
        schema_version = db.schema_version.as_i32(),
        metadata_path = %metadata_path,
        "Connected to database"
    );
    log_pool_metrics(&db.pool);
    db.capabilities()
        .require_reindex("reindex worker")
        .context("deployed schema cannot run reindex operations")?;

    let stores = ReindexStores::from_database(
        &db,
        Arc::new(FilesystemMetadataStore::new(metadata_path)),
    );
    let handle = WorkerBuilder::new(stores)
        .with_config(WorkerConfig::from_env())
        .with_reindex_config(reindex_config)
        .build()
        .start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(
        subsystem = "jobs",
        component = "main",
        "Shutdown signal received"
    );
    log_pool_metrics(&db.pool);

    handle.shutdown().await.context("worker shutdown failed")?;
    db.pool.close().await;
    Ok(())
}
