use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::models::task::Task;

/// Task-table capability. Every mutation is a conditional update returning
/// rows-affected, so concurrent workers and DLQ re-drives serialize on the
/// row predicate instead of a lock.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(
        &self,
        id: Uuid,
        image_key: &str,
        context_text: &str,
    ) -> Result<Task, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    async fn claim_for_processing(&self, id: Uuid) -> Result<u64, StoreError>;

    async fn store_candidates(&self, id: Uuid, alt1: &str, alt2: &str)
        -> Result<u64, StoreError>;

    async fn mark_failed(&self, id: Uuid, last_error: &str) -> Result<u64, StoreError>;

    async fn reset_for_redrive(&self, id: Uuid) -> Result<u64, StoreError>;

    async fn approve(
        &self,
        id: Uuid,
        selected_index: i32,
        final_alt: &str,
        is_approved: bool,
    ) -> Result<Option<Task>, StoreError>;

    async fn stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("task store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
        }
    }
}

/// Production task store over the PostgreSQL pool.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(
        &self,
        id: Uuid,
        image_key: &str,
        context_text: &str,
    ) -> Result<Task, StoreError> {
        Ok(queries::insert_task(&self.pool, id, image_key, context_text).await?)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(queries::get_task(&self.pool, id).await?)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(queries::delete_task(&self.pool, id).await?)
    }

    async fn claim_for_processing(&self, id: Uuid) -> Result<u64, StoreError> {
        Ok(queries::claim_for_processing(&self.pool, id).await?)
    }

    async fn store_candidates(
        &self,
        id: Uuid,
        alt1: &str,
        alt2: &str,
    ) -> Result<u64, StoreError> {
        Ok(queries::store_candidates(&self.pool, id, alt1, alt2).await?)
    }

    async fn mark_failed(&self, id: Uuid, last_error: &str) -> Result<u64, StoreError> {
        Ok(queries::mark_failed(&self.pool, id, last_error).await?)
    }

    async fn reset_for_redrive(&self, id: Uuid) -> Result<u64, StoreError> {
        Ok(queries::reset_for_redrive(&self.pool, id).await?)
    }

    async fn approve(
        &self,
        id: Uuid,
        selected_index: i32,
        final_alt: &str,
        is_approved: bool,
    ) -> Result<Option<Task>, StoreError> {
        Ok(queries::approve_task(&self.pool, id, selected_index, final_alt, is_approved).await?)
    }

    async fn stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError> {
        Ok(queries::stale_pending(&self.pool, cutoff, limit).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
