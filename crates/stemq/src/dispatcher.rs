use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;
use crate::error::StoreError;
use crate::models::JobKind;
use crate::pipeline::{MixJob, Outcome, PipelineContext};
use crate::recovery::Recovery;

/// Timer-driven queue consumer.
///
/// Each tick of a class claims at most one queued job and hands it to a
/// spawned task. The number of running pipelines is capped by `workers`.
pub struct Dispatcher {
    ctx: Arc<PipelineContext>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.config.workers));
        Self { ctx, permits }
    }

    /// Claim the oldest queued job of `kind`, binding a fresh execution handle
    pub fn claim(&self, kind: JobKind) -> Result<Option<MixJob>, StoreError> {
        let execution_id = Uuid::new_v4();
        let claimed = self.ctx.store.claim_next_of(kind, execution_id, Utc::now())?;
        Ok(claimed.map(|id| {
            info!("Job {}: claimed {} mix (execution {})", id, kind, execution_id);
            MixJob::new(kind, id)
        }))
    }

    /// One dispatcher tick for `kind`. Returns the handle of the spawned run,
    /// if one was started.
    pub fn tick(&self, kind: JobKind) -> Option<JoinHandle<Outcome>> {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("All {} worker(s) busy, skipping {} tick", self.ctx.config.workers, kind);
                return None;
            }
        };

        let job = match self.claim(kind) {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("No queued {} mixes", kind);
                return None;
            }
            Err(e) => {
                error!("Failed to claim {} mix: {}", kind, e);
                return None;
            }
        };

        let ctx = Arc::clone(&self.ctx);
        Some(tokio::spawn(async move {
            let _permit = permit;
            job.execute(&ctx).await
        }))
    }

    /// Poll both queues and run recovery until `shutdown` resolves
    pub async fn run(&self, recovery: &Recovery, shutdown: impl Future<Output = ()>) -> Result<()> {
        let config = &self.ctx.config;
        let mut static_timer = tokio::time::interval(Duration::from_secs(config.static_poll_secs));
        let mut dynamic_timer = tokio::time::interval(Duration::from_secs(config.dynamic_poll_secs));
        let mut recovery_timer = tokio::time::interval(Duration::from_secs(config.recovery_interval_secs));
        for timer in [&mut static_timer, &mut dynamic_timer, &mut recovery_timer] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }
        // Startup recovery already ran; skip the immediate first tick.
        recovery_timer.reset();

        info!(
            "Dispatcher running: static every {}s, dynamic every {}s, {} worker(s)",
            config.static_poll_secs, config.dynamic_poll_secs, config.workers
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = static_timer.tick() => {
                    self.tick(JobKind::Static);
                }
                _ = dynamic_timer.tick() => {
                    self.tick(JobKind::Dynamic);
                }
                _ = recovery_timer.tick() => {
                    match recovery.run_once(Utc::now()).await {
                        Ok(report) => debug!(
                            "Recovery pass: {} requeued, {} workspace(s) removed",
                            report.requeued.len(),
                            report.removed_dirs.len()
                        ),
                        Err(e) => error!("Recovery pass failed: {:#}", e),
                    }
                }
                _ = &mut shutdown => {
                    let running = config.workers - self.permits.available_permits();
                    info!("🛑 Shutting down dispatcher ({} job(s) still running)", running);
                    break;
                }
            }
        }
        Ok(())
    }
}
