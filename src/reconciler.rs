use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::db::store::TaskStore;
use crate::models::task::TaskMessage;
use crate::services::broker::{Broker, MAIN_QUEUE};
use crate::services::storage::ObjectStore;

const SWEEP_BATCH: i64 = 100;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub interval: Duration,
    /// Age before a PENDING row is considered to have lost its message.
    pub grace: Duration,
    /// Age before an orphaned row (no blob) is deleted.
    pub gc_age: Duration,
}

pub struct ReconcilerContext {
    pub store: Arc<dyn TaskStore>,
    pub blobs: Arc<dyn ObjectStore>,
    pub broker: Arc<dyn Broker>,
    pub settings: ReconcilerSettings,
}

/// Background repair sweep owned by the ingress process.
///
/// A crash between the row insert and the publish leaves a PENDING row with
/// no message; re-publishing is safe because workers dedupe through the
/// status guard. A rollback failure can also leave a row whose blob never
/// made it; those are deleted once old enough.
pub async fn run(ctx: &ReconcilerContext, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(ctx.settings.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = sweep(ctx).await {
                    tracing::error!(error = %e, "reconciler sweep failed");
                }
            }
        }
    }

    tracing::info!("shutdown signal observed, reconciler exiting");
}

/// One sweep pass. Returns how many messages were re-published.
pub async fn sweep(ctx: &ReconcilerContext) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let now = Utc::now();
    let stale_cutoff = now - chrono::Duration::from_std(ctx.settings.grace)?;
    let gc_cutoff = now - chrono::Duration::from_std(ctx.settings.gc_age)?;

    let stale = ctx.store.stale_pending(stale_cutoff, SWEEP_BATCH).await?;
    let mut republished = 0;

    for task in stale {
        if task.created_at < gc_cutoff && !ctx.blobs.exists(&task.image_key).await? {
            tracing::warn!(task_id = %task.id, "orphan row without blob, deleting");
            ctx.store.delete(task.id).await?;
            continue;
        }

        let message = serde_json::to_string(&TaskMessage::for_task(&task))?;
        ctx.broker
            .publish(MAIN_QUEUE, &message, Duration::ZERO)
            .await?;
        republished += 1;
        tracing::info!(task_id = %task.id, "stale PENDING task re-published");
    }

    if republished > 0 {
        tracing::info!(republished, "reconciler sweep complete");
    }
    Ok(republished)
}
