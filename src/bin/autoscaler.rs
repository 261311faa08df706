use std::sync::Arc;
use std::time::Duration;

use altify::{
    autoscaler::{self, AutoscalerContext, ComposeOrchestrator, ScalerSettings},
    config::AppConfig,
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

    tracing::info!("Starting queue-depth autoscaler");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let broker = RedisBroker::new(&config.redis_url).expect("Failed to initialize broker");

    let ctx = AutoscalerContext {
        broker: Arc::new(broker),
        orchestrator: Arc::new(ComposeOrchestrator),
        settings: ScalerSettings {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            target_per_worker: config.scale_target,
            cooldown: Duration::from_secs(config.cooldown_sec),
            poll_interval: Duration::from_secs(config.poll_interval_sec),
            service: config.worker_service.clone(),
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

    autoscaler::run(&ctx, shutdown_rx).await;
}
