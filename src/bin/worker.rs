use std::sync::Arc;
use std::time::Duration;

use altify::{
    config::AppConfig,
    db::{self, store::PgTaskStore},
    services::{broker::RedisBroker, inference::LlavaClient, storage::MinioStore},
    worker::{self, WorkerContext},
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting alt-text generation worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // A worker owns one inference slot and updates rows sequentially, so a
    // pair of connections is all it can ever use.
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, 2)
        .await
        .expect("Failed to connect to database");

    // Initialize adapters
    tracing::info!("Initializing services");
    let blobs = MinioStore::new(
        &config.minio_bucket,
        &config.minio_endpoint,
        &config.minio_access_key,
        &config.minio_secret_key,
    )
    .expect("Failed to initialize object store");

    let broker = RedisBroker::new(&config.redis_url).expect("Failed to initialize broker");

    let inferencer = LlavaClient::new(
        &config.infer_endpoint,
        Duration::from_secs(config.infer_timeout_sec),
    )
    .expect("Failed to initialize inference client");

    // Warm the model before taking work so the first message does not pay
    // the load time.
    tracing::info!("Warming up inference backend");
    if let Err(e) = inferencer.warmup().await {
        tracing::warn!(error = %e, "inference backend not warm yet, continuing");
    }

    let ctx = WorkerContext {
        store: Arc::new(PgTaskStore::new(db_pool)),
        blobs: Arc::new(blobs),
        broker: Arc::new(broker),
        inferencer: Arc::new(inferencer),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for shutdown signal");
        tracing::info!("shutdown signal received, finishing current message");
        let _ = shutdown_tx.send(true);
    });

    worker::run(&ctx, shutdown_rx).await;
}
