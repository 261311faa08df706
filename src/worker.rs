use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::db::store::TaskStore;
use crate::models::task::TaskMessage;
use crate::services::broker::{Broker, BrokerError, Delivery, Disposition, MAIN_QUEUE};
use crate::services::inference::Inferencer;
use crate::services::storage::{ObjectStore, StorageError};

const RECEIVE_WAIT: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Everything one worker process needs to drain the main queue.
pub struct WorkerContext {
    pub store: Arc<dyn TaskStore>,
    pub blobs: Arc<dyn ObjectStore>,
    pub broker: Arc<dyn Broker>,
    pub inferencer: Arc<dyn Inferencer>,
}

/// How a single delivery was settled. Returned for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Candidates stored, task DONE, message acked.
    Completed,
    /// The row was already terminal; duplicate delivery acked and dropped.
    DuplicateDropped,
    /// The message body was not a valid task message; acked and dropped.
    Poisoned,
    /// Deterministic failure; task FAILED, message acked.
    TerminalFailure(String),
    /// Transient failure; message routed to the DLQ, row left PROCESSING.
    DeadLettered(String),
}

/// Message pump for one inference slot. Honors the shutdown signal between
/// messages; an in-flight message is always finished first.
pub async fn run(ctx: &WorkerContext, mut shutdown: watch::Receiver<bool>) {
    tracing::info!("worker ready, consuming {}", MAIN_QUEUE);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            received = ctx.broker.receive(MAIN_QUEUE, RECEIVE_WAIT) => match received {
                Ok(Some(delivery)) => match process_delivery(ctx, &delivery).await {
                    Ok(outcome) => {
                        tracing::debug!(?outcome, "delivery settled");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to settle delivery");
                        sleep(ERROR_BACKOFF).await;
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "broker receive failed");
                    sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    tracing::info!("shutdown signal observed, worker exiting");
}

/// Process one delivery end to end and settle it exactly once.
pub async fn process_delivery(
    ctx: &WorkerContext,
    delivery: &Delivery,
) -> Result<Outcome, BrokerError> {
    let message: TaskMessage = match serde_json::from_str(&delivery.payload) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "undecodable message, dropping");
            ack(ctx, delivery).await?;
            return Ok(Outcome::Poisoned);
        }
    };

    tracing::info!(task_id = %message.id, image_key = %message.image_key, "processing task");

    // Claim guard: dedupes duplicate deliveries and counts the attempt.
    match ctx.store.claim_for_processing(message.id).await {
        Ok(0) => {
            tracing::info!(task_id = %message.id, "task already terminal, dropping duplicate");
            ack(ctx, delivery).await?;
            return Ok(Outcome::DuplicateDropped);
        }
        Ok(_) => {}
        Err(e) => {
            return dead_letter(ctx, delivery, format!("task store unavailable: {e}")).await;
        }
    }

    let image = match ctx.blobs.get(&message.image_key).await {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound(key)) => {
            return fail_terminal(ctx, delivery, &message, format!("image missing at {key}"))
                .await;
        }
        Err(e) => {
            return dead_letter(ctx, delivery, format!("blob store unavailable: {e}")).await;
        }
    };

    let started = std::time::Instant::now();
    let candidates = ctx
        .inferencer
        .generate(&image, &message.context, 2)
        .await;
    metrics::histogram!("alt_inference_seconds").record(started.elapsed().as_secs_f64());

    let candidates = match candidates {
        Ok(c) => c,
        Err(e) if e.is_transient() => {
            return dead_letter(ctx, delivery, format!("inference failed: {e}")).await;
        }
        Err(e) => {
            return fail_terminal(ctx, delivery, &message, format!("inference failed: {e}"))
                .await;
        }
    };

    let (alt1, alt2) = match (candidates.first(), candidates.get(1)) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => (a.clone(), b.clone()),
        _ => {
            return fail_terminal(
                ctx,
                delivery,
                &message,
                "model returned fewer than two candidates".to_string(),
            )
            .await;
        }
    };

    match ctx.store.store_candidates(message.id, &alt1, &alt2).await {
        Ok(0) => {
            // A racing worker settled the row first; its result stands.
            tracing::info!(task_id = %message.id, "result already settled elsewhere");
            ack(ctx, delivery).await?;
            Ok(Outcome::DuplicateDropped)
        }
        Ok(_) => {
            metrics::counter!("alt_tasks_completed").increment(1);
            tracing::info!(task_id = %message.id, "candidates stored, task DONE");
            ack(ctx, delivery).await?;
            Ok(Outcome::Completed)
        }
        Err(e) => dead_letter(ctx, delivery, format!("result persistence failed: {e}")).await,
    }
}

async fn ack(ctx: &WorkerContext, delivery: &Delivery) -> Result<(), BrokerError> {
    if let Err(e) = ctx.broker.settle(delivery, Disposition::Ack).await {
        // Requeue so the delivery is retried; the claim guard dedupes it.
        tracing::warn!(error = %e, "ack failed, requeueing delivery");
        ctx.broker
            .settle(delivery, Disposition::NackRequeue)
            .await?;
    }
    Ok(())
}

async fn fail_terminal(
    ctx: &WorkerContext,
    delivery: &Delivery,
    message: &TaskMessage,
    reason: String,
) -> Result<Outcome, BrokerError> {
    tracing::warn!(task_id = %message.id, reason = %reason, "deterministic failure, task FAILED");
    if let Err(e) = ctx.store.mark_failed(message.id, &reason).await {
        // Could not even record the failure; treat as transient.
        return dead_letter(ctx, delivery, format!("failed to mark FAILED: {e}")).await;
    }
    metrics::counter!("alt_tasks_failed").increment(1);
    ack(ctx, delivery).await?;
    Ok(Outcome::TerminalFailure(reason))
}

async fn dead_letter(
    ctx: &WorkerContext,
    delivery: &Delivery,
    reason: String,
) -> Result<Outcome, BrokerError> {
    tracing::warn!(reason = %reason, "transient failure, dead-lettering");
    ctx.broker
        .settle(
            delivery,
            Disposition::NackDlq {
                reason: reason.clone(),
            },
        )
        .await?;
    Ok(Outcome::DeadLettered(reason))
}
