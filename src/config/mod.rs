use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the work broker
    pub redis_url: String,

    /// MinIO / S3-compatible endpoint URL
    pub minio_endpoint: String,

    /// Bucket holding uploaded task images
    #[serde(default = "default_bucket")]
    pub minio_bucket: String,

    pub minio_access_key: String,

    pub minio_secret_key: String,

    /// Base URL of the LLaVA serving endpoint
    pub infer_endpoint: String,

    /// Hard timeout for a single inference call, in seconds
    #[serde(default = "default_infer_timeout")]
    pub infer_timeout_sec: u64,

    /// Delivery budget before a task is settled to FAILED
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_min_workers")]
    pub min_workers: u32,

    #[serde(default = "default_max_workers")]
    pub max_workers: u32,

    /// Queue depth one worker is expected to drain per poll interval
    #[serde(default = "default_scale_target")]
    pub scale_target: u32,

    /// Scale-down cooldown window, in seconds
    #[serde(default = "default_cooldown")]
    pub cooldown_sec: u64,

    /// Autoscaler poll period, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_sec: u64,

    /// Reconciler sweep period, in seconds
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_sec: u64,

    /// Grace window before a PENDING row is considered stale, in seconds
    #[serde(default = "default_reconcile_grace")]
    pub reconcile_grace_sec: u64,

    /// Age past which orphaned rows are garbage-collected, in seconds
    #[serde(default = "default_gc_age")]
    pub gc_age_sec: u64,

    /// Base delay for DLQ re-drive backoff, in milliseconds
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,

    /// Cap on the DLQ re-drive backoff delay, in milliseconds
    #[serde(default = "default_retry_cap")]
    pub retry_cap_ms: u64,

    /// Compose service name the autoscaler resizes
    #[serde(default = "default_worker_service")]
    pub worker_service: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_bucket() -> String {
    "alt-images".to_string()
}

fn default_infer_timeout() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_workers() -> u32 {
    1
}

fn default_max_workers() -> u32 {
    2
}

fn default_scale_target() -> u32 {
    4
}

fn default_cooldown() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    10
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_reconcile_grace() -> u64 {
    30
}

fn default_gc_age() -> u64 {
    3600
}

fn default_retry_base() -> u64 {
    5000
}

fn default_retry_cap() -> u64 {
    60000
}

fn default_worker_service() -> String {
    "worker".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
