use std::sync::Arc;
use std::time::Duration;

use altify::{
    config::AppConfig,
    db::{self, store::PgTaskStore},
    dlq::{self, DlqContext, DlqPolicy},
    services::broker::RedisBroker,
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

    tracing::info!("Starting dead-letter consumer");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Dead letters are settled one at a time; two connections cover the
    // lookup-then-update pair.
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, 2)
        .await
        .expect("Failed to connect to database");

    let broker = RedisBroker::new(&config.redis_url).expect("Failed to initialize broker");

    let ctx = DlqContext {
        store: Arc::new(PgTaskStore::new(db_pool)),
        broker: Arc::new(broker),
        policy: DlqPolicy {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_cap_ms),
        },
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for shutdown signal");
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    dlq::run(&ctx, shutdown_rx).await;
}
