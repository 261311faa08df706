mod app_state;
mod config;
mod db;
mod error;
mod ingest;
mod models;
mod reconciler;
mod routes;
mod services;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use db::store::PgTaskStore;
use reconciler::{ReconcilerContext, ReconcilerSettings};
use services::{broker::RedisBroker, storage::MinioStore};

/// Staging holds at most one connection per in-flight upload; sized for the
/// expected concurrent-editor load with headroom for the reconciler.
const INGRESS_POOL_SIZE: u32 = 16;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing altify ingress server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("alt_tasks_submitted", "Total tasks accepted by ingress");
    metrics::describe_counter!("alt_tasks_completed", "Total tasks settled to DONE");
    metrics::describe_counter!("alt_tasks_failed", "Total tasks settled to FAILED");
    metrics::describe_counter!(
        "alt_tasks_redriven",
        "Total dead-lettered tasks re-driven onto the main queue"
    );
    metrics::describe_histogram!(
        "alt_inference_seconds",
        "Time spent generating one candidate pair"
    );
    metrics::describe_gauge!("alt_queue_ready", "Messages ready on the main queue");
    metrics::describe_gauge!("alt_queue_unacked", "Messages delivered but not yet settled");
    metrics::describe_gauge!("alt_worker_replicas", "Current worker replica count");

    // Initialize database connection pool: one connection per in-flight
    // upload, plus the reconciler sweep.
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, INGRESS_POOL_SIZE)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize adapters
    tracing::info!("Initializing MinIO object store");
    let blobs = MinioStore::new(
        &config.minio_bucket,
        &config.minio_endpoint,
        &config.minio_access_key,
        &config.minio_secret_key,
    )
    .expect("Failed to initialize object store");

    tracing::info!("Connecting to Redis broker");
    let broker = RedisBroker::new(&config.redis_url).expect("Failed to initialize broker");

    let state = AppState::new(
        Arc::new(PgTaskStore::new(db_pool)),
        Arc::new(blobs),
        Arc::new(broker),
    );

    // Shutdown signal shared with the reconciler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for shutdown signal");
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // Reconciler repairs partial staging states in the background
    let reconciler_ctx = ReconcilerContext {
        store: state.store.clone(),
        blobs: state.blobs.clone(),
        broker: state.broker.clone(),
        settings: ReconcilerSettings {
            interval: Duration::from_secs(config.reconcile_interval_sec),
            grace: Duration::from_secs(config.reconcile_grace_sec),
            gc_age: Duration::from_secs(config.gc_age_sec),
        },
    };
    tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { reconciler::run(&reconciler_ctx, shutdown).await }
    });

    // Build API routes
    let app = routes::router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024 * 1024));

    tracing::info!("Starting altify on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let mut shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .expect("Server error");
}
