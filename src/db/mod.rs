use sqlx::{postgres::PgPoolOptions, PgPool};

/// Open a PostgreSQL pool sized for the calling process.
///
/// Each process passes its own ceiling: the ingress server holds one
/// connection per in-flight request, while the worker and DLQ consumer
/// touch the task table strictly sequentially and need only a couple.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

pub mod queries;
pub mod store;
