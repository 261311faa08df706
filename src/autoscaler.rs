use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::services::broker::{Broker, QueueDepth, MAIN_QUEUE};

/// Replica-resizing capability, opaque to the scaling decision.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn scale(&self, service: &str, replicas: u32) -> Result<(), OrchestratorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to run orchestrator command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("orchestrator command failed: {0}")]
    CommandFailed(String),
}

/// Resizes workers through `docker compose up -d --scale`.
pub struct ComposeOrchestrator;

#[async_trait]
impl Orchestrator for ComposeOrchestrator {
    async fn scale(&self, service: &str, replicas: u32) -> Result<(), OrchestratorError> {
        let output = tokio::process::Command::new("docker")
            .args([
                "compose",
                "up",
                "-d",
                "--scale",
                &format!("{service}={replicas}"),
                "--no-recreate",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(OrchestratorError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ScalerSettings {
    pub min_workers: u32,
    pub max_workers: u32,
    /// Queue depth one worker is expected to drain per poll interval.
    pub target_per_worker: u32,
    pub cooldown: Duration,
    pub poll_interval: Duration,
    pub service: String,
}

#[derive(Debug)]
pub struct ScalerState {
    pub current: u32,
    /// Start of the current continuous low-depth period, if any.
    low_since: Option<Instant>,
}

impl ScalerState {
    pub fn new(current: u32) -> Self {
        Self {
            current,
            low_since: None,
        }
    }
}

/// Replica count the ready depth calls for, clamped to `[min, max]`.
pub fn desired_replicas(settings: &ScalerSettings, ready: u64) -> u32 {
    let per_worker = settings.target_per_worker.max(1) as u64;
    let desired = ready.div_ceil(per_worker) as u32;
    desired.clamp(settings.min_workers, settings.max_workers)
}

/// One control-loop decision.
///
/// Scale-up is immediate. Scale-down requires the desired count to stay
/// below the current one for the whole cooldown window, and is held off
/// entirely while any delivery is unacked (those workers are busy).
pub fn plan(
    settings: &ScalerSettings,
    state: &mut ScalerState,
    depth: QueueDepth,
    now: Instant,
) -> Option<u32> {
    let desired = desired_replicas(settings, depth.ready);

    if desired > state.current {
        state.low_since = None;
        return Some(desired);
    }

    if desired == state.current || depth.unacked > 0 {
        state.low_since = None;
        return None;
    }

    let since = *state.low_since.get_or_insert(now);
    if now.duration_since(since) >= settings.cooldown {
        state.low_since = None;
        Some(desired)
    } else {
        None
    }
}

pub struct AutoscalerContext {
    pub broker: Arc<dyn Broker>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub settings: ScalerSettings,
}

/// Poll queue depth and resize the worker service until shutdown.
/// Report-only when the orchestrator is unreachable.
pub async fn run(ctx: &AutoscalerContext, mut shutdown: watch::Receiver<bool>) {
    let settings = &ctx.settings;
    let mut state = ScalerState::new(settings.min_workers);

    // Establish the baseline replica count.
    match ctx
        .orchestrator
        .scale(&settings.service, settings.min_workers)
        .await
    {
        Ok(()) => metrics::gauge!("alt_worker_replicas").set(settings.min_workers as f64),
        Err(e) => tracing::warn!(error = %e, "orchestrator unreachable, reporting only"),
    }

    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let depth = match ctx.broker.queue_depth(MAIN_QUEUE).await {
            Ok(depth) => depth,
            Err(e) => {
                tracing::error!(error = %e, "queue depth query failed");
                continue;
            }
        };

        metrics::gauge!("alt_queue_ready").set(depth.ready as f64);
        metrics::gauge!("alt_queue_unacked").set(depth.unacked as f64);
        tracing::debug!(
            ready = depth.ready,
            unacked = depth.unacked,
            replicas = state.current,
            "autoscaler tick"
        );

        if let Some(desired) = plan(settings, &mut state, depth, Instant::now()) {
            tracing::info!(
                from = state.current,
                to = desired,
                ready = depth.ready,
                "resizing worker pool"
            );
            match ctx.orchestrator.scale(&settings.service, desired).await {
                Ok(()) => {
                    state.current = desired;
                    metrics::gauge!("alt_worker_replicas").set(desired as f64);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "scale failed, reporting only");
                }
            }
        }
    }

    tracing::info!("shutdown signal observed, autoscaler exiting");
}
