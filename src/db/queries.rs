use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::task::Task;

/// Insert a freshly staged task in PENDING state.
pub async fn insert_task(
    pool: &PgPool,
    id: Uuid,
    image_key: &str,
    context_text: &str,
) -> Result<Task, sqlx::Error> {
    sqlx::query_as::<_, Task>(
        r#"
        INSERT INTO tasks (id, image_key, context_text, status)
        VALUES ($1, $2, $3, 'PENDING')
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(image_key)
    .bind(context_text)
    .fetch_one(pool)
    .await
}

pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>, sqlx::Error> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn delete_task(pool: &PgPool, id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Optimistic claim guard. Zero rows affected means the task is already
/// terminal and the delivery must be dropped without side effects.
pub async fn claim_for_processing(pool: &PgPool, id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'PROCESSING', attempts = attempts + 1, updated_at = NOW()
        WHERE id = $1 AND status IN ('PENDING', 'PROCESSING')
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Write both candidates and settle to DONE in one statement. Guarded on
/// PROCESSING so that of two racing workers exactly one update wins.
pub async fn store_candidates(
    pool: &PgPool,
    id: Uuid,
    alt1: &str,
    alt2: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET alt1 = $2, alt2 = $3, status = 'DONE', last_error = NULL,
            updated_at = NOW(), finished_at = NOW()
        WHERE id = $1 AND status = 'PROCESSING'
        "#,
    )
    .bind(id)
    .bind(alt1)
    .bind(alt2)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn mark_failed(pool: &PgPool, id: Uuid, last_error: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'FAILED', last_error = $2, updated_at = NOW(), finished_at = NOW()
        WHERE id = $1 AND status IN ('PENDING', 'PROCESSING')
        "#,
    )
    .bind(id)
    .bind(last_error)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// DLQ re-drive reset; the one sanctioned non-monotone transition.
pub async fn reset_for_redrive(pool: &PgPool, id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'PENDING', updated_at = NOW()
        WHERE id = $1 AND status IN ('PENDING', 'PROCESSING')
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Approval write, guarded on DONE.
pub async fn approve_task(
    pool: &PgPool,
    id: Uuid,
    selected_index: i32,
    final_alt: &str,
    is_approved: bool,
) -> Result<Option<Task>, sqlx::Error> {
    sqlx::query_as::<_, Task>(
        r#"
        UPDATE tasks
        SET selected_index = $2, final_alt = $3, is_approved = $4,
            finished_at = COALESCE(finished_at, NOW()), updated_at = NOW()
        WHERE id = $1 AND status = 'DONE'
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(selected_index)
    .bind(final_alt)
    .bind(is_approved)
    .fetch_optional(pool)
    .await
}

/// PENDING rows untouched since the cutoff; the reconciler re-publishes these.
pub async fn stale_pending(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Task>, sqlx::Error> {
    sqlx::query_as::<_, Task>(
        r#"
        SELECT * FROM tasks
        WHERE status = 'PENDING' AND updated_at < $1
        ORDER BY updated_at ASC
        LIMIT $2
        "#,
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await
}
