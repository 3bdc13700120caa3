//! Polling scheduler
//!
//! Claims the oldest pending job and hands it to the batch worker, one job
//! at a time. Instances coordinate only through the store's atomic claim.
//! The same loop periodically returns stale PROCESSING jobs to the queue.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use uuid::Uuid;

use crate::error::IngestError;
use crate::services::progress::JobLog;
use crate::services::store::{JobStore, StoreError};
use crate::services::worker::{BatchWorker, JobOutcome};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub stale_timeout: Duration,
    pub sweep_interval: Duration,
}

pub struct Scheduler {
    jobs: Arc<dyn JobStore>,
    worker: Arc<BatchWorker>,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(jobs: Arc<dyn JobStore>, worker: Arc<BatchWorker>, settings: SchedulerSettings) -> Self {
        Self {
            jobs,
            worker,
            settings,
        }
    }

    /// Claim and run the next pending job, if any.
    pub async fn run_once(&self) -> Result<Option<(Uuid, JobOutcome)>, IngestError> {
        let Some(job) = self.jobs.claim_next_pending(self.worker.worker_id()).await? else {
            return Ok(None);
        };

        let job_id = job.id;
        tracing::info!(
            job_id = %job_id,
            worker_id = %self.worker.worker_id(),
            resume_at_batch = job.batches_completed,
            "Claimed ingestion job"
        );

        let outcome = self.worker.execute(job).await?;
        tracing::info!(job_id = %job_id, outcome = ?outcome, "Finished ingestion job");
        Ok(Some((job_id, outcome)))
    }

    /// Return every job idle past the stale timeout to PENDING. Returns the
    /// ids that were released.
    pub async fn sweep_stale(&self) -> Result<Vec<Uuid>, StoreError> {
        let timeout = self.settings.stale_timeout;
        let mut released = Vec::new();

        for job in self.jobs.list_stale(timeout).await? {
            if !self.jobs.mark_stale(job.id, timeout).await? {
                continue;
            }
            JobLog::new(self.jobs.clone(), job.id)
                .warning(format!(
                    "No progress from worker {} for over {}s; returned to queue at batch {}",
                    job.claimed_by.as_deref().unwrap_or("unknown"),
                    timeout.as_secs(),
                    job.batches_completed + 1
                ))
                .await;
            released.push(job.id);
        }

        Ok(released)
    }

    /// Poll until `shutdown` resolves. A job in flight is finished first.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut last_sweep: Option<Instant> = None;

        loop {
            if last_sweep.map_or(true, |at| at.elapsed() >= self.settings.sweep_interval) {
                match self.sweep_stale().await {
                    Ok(released) if !released.is_empty() => {
                        tracing::warn!(count = released.len(), "Released stale jobs");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Stale job sweep failed"),
                }
                last_sweep = Some(Instant::now());
            }

            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => {
                    tracing::trace!("No pending jobs, sleeping");
                    true
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error processing job, leaving it to stale recovery");
                    true
                }
            };

            let pause = if idle {
                self.settings.poll_interval
            } else {
                Duration::ZERO
            };
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, scheduler stopping");
                    return;
                }
                _ = sleep(pause) => {}
            }
        }
    }
}
