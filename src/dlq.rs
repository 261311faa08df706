use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::db::store::TaskStore;
use crate::models::task::TaskMessage;
use crate::services::broker::{Broker, BrokerError, DeadLetter, Delivery, Disposition, DLQ,
    MAIN_QUEUE};

const RECEIVE_WAIT: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Retry budget and backoff shape for dead-letter re-drives.
#[derive(Debug, Clone)]
pub struct DlqPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl DlqPolicy {
    /// Exponential backoff: `base * 2^(attempts-1)`, capped.
    pub fn redrive_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlqOutcome {
    /// Row reset to PENDING, message re-published with a backoff delay.
    Redriven { delay: Duration },
    /// Retry budget exhausted; task settled to FAILED.
    Exhausted,
    /// Nothing to do (row terminal or missing, or envelope undecodable).
    Dropped,
}

pub struct DlqContext {
    pub store: Arc<dyn TaskStore>,
    pub broker: Arc<dyn Broker>,
    pub policy: DlqPolicy,
}

/// Consume the dead-letter queue until shutdown.
pub async fn run(ctx: &DlqContext, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(
        max_attempts = ctx.policy.max_attempts,
        "DLQ consumer ready, consuming {}",
        DLQ
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            received = ctx.broker.receive(DLQ, RECEIVE_WAIT) => match received {
                Ok(Some(delivery)) => match process_dead_letter(ctx, &delivery).await {
                    Ok(outcome) => {
                        tracing::debug!(?outcome, "dead letter settled");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to settle dead letter");
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

    tracing::info!("shutdown signal observed, DLQ consumer exiting");
}

/// Decide one dead letter: re-drive under budget, otherwise settle FAILED.
///
/// Idempotent under duplicate DLQ delivery: the row guard refuses the reset
/// once the task is terminal, and the attempts counter only moves when a
/// worker claims a delivery.
pub async fn process_dead_letter(
    ctx: &DlqContext,
    delivery: &Delivery,
) -> Result<DlqOutcome, BrokerError> {
    let envelope: DeadLetter = match serde_json::from_str(&delivery.payload) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "undecodable dead-letter envelope, dropping");
            ctx.broker.settle(delivery, Disposition::Ack).await?;
            return Ok(DlqOutcome::Dropped);
        }
    };

    let message: TaskMessage = match serde_json::from_str(&envelope.body) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "dead letter carries undecodable body, dropping");
            ctx.broker.settle(delivery, Disposition::Ack).await?;
            return Ok(DlqOutcome::Dropped);
        }
    };

    let row = match ctx.store.get(message.id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            tracing::warn!(task_id = %message.id, "dead letter for unknown task, dropping");
            ctx.broker.settle(delivery, Disposition::Ack).await?;
            return Ok(DlqOutcome::Dropped);
        }
        Err(e) => {
            tracing::error!(task_id = %message.id, error = %e, "row lookup failed, requeueing");
            ctx.broker
                .settle(delivery, Disposition::NackRequeue)
                .await?;
            return Ok(DlqOutcome::Dropped);
        }
    };

    if row.status.is_terminal() {
        tracing::info!(task_id = %message.id, status = %row.status, "task already settled");
        ctx.broker.settle(delivery, Disposition::Ack).await?;
        return Ok(DlqOutcome::Dropped);
    }

    let attempts = (row.attempts.max(0) as u32).max(envelope.deaths);

    if attempts < ctx.policy.max_attempts {
        let reset = match ctx.store.reset_for_redrive(message.id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(task_id = %message.id, error = %e, "re-drive reset failed");
                ctx.broker
                    .settle(delivery, Disposition::NackRequeue)
                    .await?;
                return Ok(DlqOutcome::Dropped);
            }
        };
        if reset == 0 {
            // Settled by a racing worker between lookup and reset.
            ctx.broker.settle(delivery, Disposition::Ack).await?;
            return Ok(DlqOutcome::Dropped);
        }

        let delay = ctx.policy.redrive_delay(attempts);
        ctx.broker.publish(MAIN_QUEUE, &envelope.body, delay).await?;
        ctx.broker.settle(delivery, Disposition::Ack).await?;

        metrics::counter!("alt_tasks_redriven").increment(1);
        tracing::info!(
            task_id = %message.id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            "dead letter re-driven with backoff"
        );
        Ok(DlqOutcome::Redriven { delay })
    } else {
        let last_error = envelope.reasons.join("; ");
        if let Err(e) = ctx.store.mark_failed(message.id, &last_error).await {
            tracing::error!(task_id = %message.id, error = %e, "failed to settle FAILED");
            ctx.broker
                .settle(delivery, Disposition::NackRequeue)
                .await?;
            return Ok(DlqOutcome::Dropped);
        }
        ctx.broker.settle(delivery, Disposition::Ack).await?;

        metrics::counter!("alt_tasks_failed").increment(1);
        tracing::warn!(
            task_id = %message.id,
            attempts,
            last_error = %last_error,
            "retry budget exhausted, task FAILED"
        );
        Ok(DlqOutcome::Exhausted)
    }
}
