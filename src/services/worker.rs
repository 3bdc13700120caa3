//! Batch worker
//!
//! Executes one claimed job: materializes its candidate set, then fetches,
//! filters and persists records batch by batch with one progress checkpoint
//! per batch. A job picked up again after stale recovery starts at its first
//! unfinished batch; records written by earlier attempts are linked, not
//! written twice.

use garde::Validate;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use uuid::Uuid;

use crate::error::IngestError;
use crate::models::job::{Job, JobStatus, ProgressDelta};
use crate::models::record::{
    ExternalId, LeadRecord, NewRecord, PersistOutcome, RecordType, StateCode,
};
use crate::services::criteria;
use crate::services::dnm::DnmGuard;
use crate::services::identifier::IdentifierGenerator;
use crate::services::progress::JobLog;
use crate::services::provider::{FetchResult, LeadProvider, ProviderError};
use crate::services::store::{JobStore, RecordStore, StoreError};

/// Backoff for provider batch fetches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per batch, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Wait before retrying after failed attempt `attempt` (1-based). The
    /// exponential delay is capped at `max_delay`; a longer provider hint
    /// wins over it.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        hint.map_or(backoff, |hint| hint.max(backoff))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    pub retry: RetryPolicy,
}

/// How a call to [`BatchWorker::execute`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
    /// The claim was lost (the job was recovered as stale); another worker
    /// owns it now.
    Released,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BatchTally {
    processed: i64,
    success: i64,
    error: i64,
}

pub struct BatchWorker {
    jobs: Arc<dyn JobStore>,
    records: Arc<dyn RecordStore>,
    dnm: Arc<DnmGuard>,
    identifiers: Arc<IdentifierGenerator>,
    provider: Arc<dyn LeadProvider>,
    settings: WorkerSettings,
}

impl BatchWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        records: Arc<dyn RecordStore>,
        dnm: Arc<DnmGuard>,
        identifiers: Arc<IdentifierGenerator>,
        provider: Arc<dyn LeadProvider>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            jobs,
            records,
            dnm,
            identifiers,
            provider,
            settings,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Run a job this worker has claimed. Store failures fail the job; an
    /// error is returned only when the store cannot record that either, and
    /// the job then stays PROCESSING until stale recovery.
    pub async fn execute(&self, job: Job) -> Result<JobOutcome, IngestError> {
        let job_id = job.id;
        let log = JobLog::new(self.jobs.clone(), job_id);

        let (job, ids) = match self.prepare(job, &log).await {
            Ok(prepared) => prepared,
            Err(IngestError::Validation(reason)) => return self.fail(job_id, &log, &reason).await,
            Err(IngestError::Persistence(e)) => {
                return self
                    .fail_on_store_error(job_id, &log, "Could not prepare candidates", e)
                    .await
            }
            Err(e) => return self.fail(job_id, &log, &e.to_string()).await,
        };

        let batches: Vec<&[ExternalId]> = ids.chunks(self.settings.batch_size.max(1)).collect();
        let total = batches.len();
        let start = usize::try_from(job.batches_completed).unwrap_or(0).min(total);
        if start > 0 {
            log.info(format!("Resuming at batch {} of {total}", start + 1)).await;
        } else {
            log.info(format!("Processing {} records in {total} batches", ids.len()))
                .await;
        }

        for (index, batch) in batches.iter().enumerate().skip(start) {
            let number = index + 1;

            match self.jobs.heartbeat(job_id, self.worker_id()).await {
                Ok(JobStatus::Cancelled) => {
                    log.info(format!("Cancelled before batch {number} of {total}"))
                        .await;
                    return Ok(JobOutcome::Cancelled);
                }
                Ok(_) => {}
                Err(e) => {
                    let context = format!("Heartbeat before batch {number} of {total} failed");
                    return self.fail_on_store_error(job_id, &log, &context, e).await;
                }
            }

            let started = Instant::now();
            let results = match self.fetch_with_retry(&log, number, total, batch).await {
                Ok(results) => results,
                Err((attempts, e)) => {
                    let details =
                        format!("Batch {number} of {total} failed after {attempts} attempts: {e}");
                    return self.fail(job_id, &log, &details).await;
                }
            };

            let tally = match self.process_batch(job_id, &log, batch, results).await {
                Ok(tally) => tally,
                Err(e) => {
                    let details = format!("Batch {number} of {total} could not be persisted: {e}");
                    return self.fail(job_id, &log, &details).await;
                }
            };
            metrics::histogram!("ingest_batch_seconds").record(started.elapsed().as_secs_f64());

            let delta = ProgressDelta {
                processed: tally.processed,
                success: tally.success,
                error: tally.error,
                batch_index: index as i32,
            };
            match self
                .jobs
                .update_progress(job_id, self.worker_id(), delta)
                .await
            {
                Ok(update) if update.clamped => {
                    log.warning(format!(
                        "Progress after batch {number} exceeded the job total; clamped to {}",
                        update.job.total_records
                    ))
                    .await;
                }
                Ok(_) => {}
                Err(StoreError::ClaimLost { .. }) => return Ok(self.released(job_id)),
                Err(e) => {
                    let details = format!("Progress checkpoint for batch {number} failed: {e}");
                    return self.fail(job_id, &log, &details).await;
                }
            }

            log.info(format!(
                "Batch {number} of {total} done: {} succeeded, {} failed",
                tally.success, tally.error
            ))
            .await;

            if number < total && !self.settings.inter_batch_delay.is_zero() {
                sleep(self.settings.inter_batch_delay).await;
            }
        }

        let finished = match self.jobs.complete(job_id, self.worker_id()).await {
            Ok(job) => job,
            Err(e) => {
                return self
                    .fail_on_store_error(job_id, &log, "Could not mark the job completed", e)
                    .await
            }
        };
        match finished.status {
            JobStatus::Completed => {
                metrics::counter!("ingest_jobs_completed").increment(1);
                log.info(format!(
                    "Job completed: {} succeeded, {} failed of {} records",
                    finished.success_count, finished.error_count, finished.total_records
                ))
                .await;
                Ok(JobOutcome::Completed)
            }
            JobStatus::Cancelled => {
                log.info("Cancelled during the final batch").await;
                Ok(JobOutcome::Cancelled)
            }
            _ => Ok(JobOutcome::Failed),
        }
    }

    /// Candidate ids in batch order, materializing them on first run.
    async fn prepare(&self, job: Job, log: &JobLog) -> Result<(Job, Vec<ExternalId>), IngestError> {
        if job.materialized {
            let ids = self.jobs.candidate_ids(job.id).await?;
            return Ok((job, ids));
        }

        let ids = criteria::expand(self.records.as_ref(), &job.criteria).await?;
        let job = self.jobs.materialize(job.id, &ids).await?;
        log.info(format!("Materialized {} candidate records", ids.len()))
            .await;
        Ok((job, ids))
    }

    async fn fetch_with_retry(
        &self,
        log: &JobLog,
        number: usize,
        total: usize,
        batch: &[ExternalId],
    ) -> Result<Vec<FetchResult>, (u32, ProviderError)> {
        let policy = &self.settings.retry;
        let mut attempt = 1;

        loop {
            match self.provider.fetch_batch(batch).await {
                Ok(results) => return Ok(results),
                Err(e) if attempt < policy.max_attempts => {
                    let delay = policy.delay(attempt, e.retry_after());
                    metrics::counter!("ingest_batch_retries").increment(1);
                    log.warning(format!(
                        "Batch {number} of {total} fetch attempt {attempt} failed, retrying in {}ms: {e}",
                        delay.as_millis()
                    ))
                    .await;
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }

    /// Apply one fetched batch. Record-level problems are counted; any other
    /// error aborts the batch.
    async fn process_batch(
        &self,
        job_id: Uuid,
        log: &JobLog,
        batch: &[ExternalId],
        results: Vec<FetchResult>,
    ) -> Result<BatchTally, IngestError> {
        let mut fetched: HashMap<ExternalId, Result<LeadRecord, String>> =
            HashMap::with_capacity(results.len());
        for result in results {
            fetched.entry(result.id).or_insert(result.outcome);
        }

        let existing: HashMap<ExternalId, Uuid> = self
            .records
            .lookup_records(batch)
            .await?
            .into_iter()
            .map(|found| (found.external_id, found.record_id))
            .collect();
        let blocked = self.dnm.blocked_reasons(batch, &existing).await?;

        let mut tally = BatchTally {
            processed: batch.len() as i64,
            ..Default::default()
        };
        for id in batch {
            let fetched = fetched.remove(id);
            match self.persist_one(job_id, id, fetched, &existing, &blocked).await {
                Ok(()) => tally.success += 1,
                Err(e) if e.is_record_level() => {
                    tally.error += 1;
                    metrics::counter!("ingest_records_rejected").increment(1);
                    let message = match (&e, blocked.get(id)) {
                        (IngestError::ComplianceViolation(_), Some(reason)) => {
                            format!("{e} ({reason})")
                        }
                        _ => e.to_string(),
                    };
                    log.warning(message).await;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(tally)
    }

    async fn persist_one(
        &self,
        job_id: Uuid,
        id: &ExternalId,
        fetched: Option<Result<LeadRecord, String>>,
        existing: &HashMap<ExternalId, Uuid>,
        blocked: &HashMap<ExternalId, String>,
    ) -> Result<(), IngestError> {
        let rejected = |reason: String| IngestError::RecordFetch {
            id: id.clone(),
            reason,
        };

        let lead = match fetched {
            Some(Ok(lead)) => lead,
            Some(Err(reason)) => return Err(rejected(reason)),
            None => return Err(rejected("not returned by provider".to_string())),
        };

        if blocked.contains_key(id) {
            return Err(IngestError::ComplianceViolation(id.clone()));
        }

        if let Some(&record_id) = existing.get(id) {
            self.records.link_record(job_id, record_id).await?;
            return Ok(());
        }

        lead.validate()
            .map_err(|report| rejected(format!("invalid record: {report}")))?;
        let state = StateCode::parse(&lead.state).map_err(rejected)?;
        let identifier = self
            .identifiers
            .generate(RecordType::from_property_type(&lead.property_type), &state)
            .await?;

        let outcome = self
            .records
            .insert_record(NewRecord {
                external_id: id.clone(),
                identifier,
                job_id,
                state,
                lead,
            })
            .await?;
        if let PersistOutcome::Inserted(record) = outcome {
            metrics::counter!("ingest_records_persisted").increment(1);
            tracing::debug!(job_id = %job_id, identifier = %record.identifier, "Persisted record");
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        log: &JobLog,
        details: &str,
    ) -> Result<JobOutcome, IngestError> {
        let job = match self.jobs.fail(job_id, self.worker_id(), details).await {
            Ok(job) => job,
            Err(StoreError::ClaimLost { .. }) => return Ok(self.released(job_id)),
            Err(e) => return Err(e.into()),
        };
        match job.status {
            JobStatus::Failed => {
                metrics::counter!("ingest_jobs_failed").increment(1);
                log.error(details).await;
                Ok(JobOutcome::Failed)
            }
            JobStatus::Cancelled => Ok(JobOutcome::Cancelled),
            _ => Ok(JobOutcome::Completed),
        }
    }

    /// Fail the job after a store error outside any batch. A lost claim
    /// releases the job instead. If the failure cannot be recorded either,
    /// the original error is returned.
    async fn fail_on_store_error(
        &self,
        job_id: Uuid,
        log: &JobLog,
        context: &str,
        error: StoreError,
    ) -> Result<JobOutcome, IngestError> {
        if matches!(error, StoreError::ClaimLost { .. }) {
            return Ok(self.released(job_id));
        }

        let details = format!("{context}: {error}");
        match self.fail(job_id, log, &details).await {
            Ok(outcome) => Ok(outcome),
            Err(fail_error) => {
                tracing::error!(
                    job_id = %job_id,
                    error = %fail_error,
                    "Could not record job failure"
                );
                Err(error.into())
            }
        }
    }

    fn released(&self, job_id: Uuid) -> JobOutcome {
        tracing::warn!(
            job_id = %job_id,
            worker_id = %self.worker_id(),
            "Claim lost, leaving job to its new owner"
        );
        JobOutcome::Released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::models::dnm::{NewDnmEntry, ReasonCategory, SubjectRef};
    use crate::models::job::{JobCriteria, LogLevel};
    use crate::services::provider::{sample_lead, ScriptedProvider};
    use crate::services::store::DnmStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(worker_id: &str, batch_size: usize) -> WorkerSettings {
        WorkerSettings {
            worker_id: worker_id.to_string(),
            batch_size,
            inter_batch_delay: Duration::ZERO,
            retry: RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        }
    }

    fn worker(
        store: &Arc<MemoryStore>,
        provider: Arc<dyn LeadProvider>,
        worker_id: &str,
        batch_size: usize,
    ) -> BatchWorker {
        BatchWorker::new(
            store.clone(),
            store.clone(),
            Arc::new(DnmGuard::new(store.clone())),
            Arc::new(IdentifierGenerator::new(store.clone(), store.clone(), 5)),
            provider,
            settings(worker_id, batch_size),
        )
    }

    fn numbered(count: usize) -> Vec<String> {
        (1..=count).map(|n| format!("I-{n}")).collect()
    }

    async fn claimed_job(store: &Arc<MemoryStore>, ids: &[&str], worker_id: &str) -> Job {
        store
            .create_job(
                &JobCriteria::RecordIdList {
                    include_ids: ids.iter().map(|id| ExternalId::new(id)).collect(),
                    exclude_ids: vec![],
                },
                "ops",
            )
            .await
            .unwrap();
        store.claim_next_pending(worker_id).await.unwrap().unwrap()
    }

    async fn warnings(store: &MemoryStore, job_id: Uuid) -> Vec<String> {
        store
            .job_logs(job_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|entry| entry.level == LogLevel::Warning)
            .map(|entry| entry.message)
            .collect()
    }

    /// Cancels the job the first time it is called.
    struct CancellingProvider {
        inner: ScriptedProvider,
        store: Arc<MemoryStore>,
        job_id: Uuid,
    }

    #[async_trait]
    impl LeadProvider for CancellingProvider {
        async fn fetch_batch(&self, ids: &[ExternalId]) -> Result<Vec<FetchResult>, ProviderError> {
            self.store.cancel(self.job_id).await.unwrap();
            self.inner.fetch_batch(ids).await
        }
    }

    /// Never answers from call `hang_on` onwards, as if the process died.
    struct HangingProvider {
        inner: Arc<ScriptedProvider>,
        calls: AtomicUsize,
        hang_on: usize,
    }

    #[async_trait]
    impl LeadProvider for HangingProvider {
        async fn fetch_batch(&self, ids: &[ExternalId]) -> Result<Vec<FetchResult>, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.hang_on {
                return std::future::pending().await;
            }
            self.inner.fetch_batch(ids).await
        }
    }

    /// On its first call, lets the job go stale and hands it to `thief`; then
    /// keeps answering 503.
    struct StealingProvider {
        store: Arc<MemoryStore>,
        job_id: Uuid,
        thief: &'static str,
        stolen: AtomicUsize,
    }

    #[async_trait]
    impl LeadProvider for StealingProvider {
        async fn fetch_batch(&self, _ids: &[ExternalId]) -> Result<Vec<FetchResult>, ProviderError> {
            if self.stolen.fetch_add(1, Ordering::SeqCst) == 0 {
                let timeout = Duration::from_secs(60);
                self.store.backdate_job(self.job_id, timeout * 2);
                assert!(self.store.mark_stale(self.job_id, timeout).await.unwrap());
                self.store.claim_next_pending(self.thief).await.unwrap().unwrap();
            }
            Err(ProviderError::Unavailable {
                status: 503,
                retry_after: None,
            })
        }
    }

    #[test]
    fn test_retry_delays() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay(1, None), Duration::from_millis(500));
        assert_eq!(policy.delay(3, None), Duration::from_millis(2000));
        assert_eq!(policy.delay(20, None), Duration::from_secs(30));
        assert_eq!(policy.delay(1, Some(Duration::from_secs(7))), Duration::from_secs(7));
        assert_eq!(policy.delay(1, Some(Duration::from_secs(600))), Duration::from_secs(600));
        assert_eq!(policy.delay(4, Some(Duration::from_millis(100))), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_blocked_record_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_dnm_entry(&NewDnmEntry {
                subject: SubjectRef::external(ExternalId::new("B")),
                reason: "owner request by phone".to_string(),
                reason_category: ReasonCategory::OwnerRequest,
                source: "support".to_string(),
            })
            .await
            .unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_leads(&["A", "B", "C"], "CA");

        let job = claimed_job(&store, &["A", "B", "C"], "w-1").await;
        let outcome = worker(&store, provider, "w-1", 400).execute(job.clone()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_records, 3);
        assert_eq!(job.processed_records, 3);
        assert_eq!(job.success_count, 2);
        assert_eq!(job.error_count, 1);
        assert!(store.record_by_external_id("B").is_none());
        assert!(store.record_by_external_id("A").is_some());

        let warnings = warnings(&store, job.id).await;
        assert!(warnings
            .iter()
            .any(|w| w.contains("do-not-mail") && w.contains("owner request by phone")));
    }

    #[tokio::test]
    async fn test_transient_batch_failures_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let ids = numbered(9);
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_leads(&ids, "TX");
        provider.fail_batches_containing("I-4", 2);

        let job = claimed_job(&store, &ids, "w-1").await;
        let outcome = worker(&store, provider.clone(), "w-1", 3)
            .execute(job.clone())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.processed_records, 9);
        assert_eq!(job.success_count + job.error_count, job.processed_records);
        assert_eq!(job.success_count, 9);
        assert_eq!(job.batches_completed, 3);
        assert_eq!(provider.calls().len(), 5);

        let retries: Vec<String> = warnings(&store, job.id)
            .await
            .into_iter()
            .filter(|w| w.contains("retrying"))
            .collect();
        assert_eq!(retries.len(), 2);
        assert!(retries.iter().all(|w| w.contains("Batch 2 of 3")));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_job() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_leads(&["I-1", "I-2", "I-3", "I-4"], "WA");
        provider.fail_batches_containing("I-3", 10);

        let job = claimed_job(&store, &["I-1", "I-2", "I-3", "I-4"], "w-1").await;
        let outcome = worker(&store, provider.clone(), "w-1", 2)
            .execute(job.clone())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Failed);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.processed_records, 2);
        assert_eq!(job.success_count, 2);
        let details = job.error_details.unwrap();
        assert!(details.contains("Batch 2 of 2"));
        assert!(details.contains("4 attempts"));
        assert_eq!(provider.calls().len(), 5);
        assert!(store.record_by_external_id("I-1").is_some());
    }

    #[tokio::test]
    async fn test_bad_records_count_as_errors() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_leads(&["OK-1"], "GA");
        provider.add_error("GONE", "record not found");
        let mut bad_state = sample_lead("BAD", "GA");
        bad_state.state = "Georgia".to_string();
        provider.add_lead("BAD", bad_state);

        let job = claimed_job(&store, &["OK-1", "GONE", "BAD", "MISSING"], "w-1").await;
        worker(&store, provider, "w-1", 10)
            .execute(job.clone())
            .await
            .unwrap();

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.success_count, 1);
        assert_eq!(job.error_count, 3);

        let warnings = warnings(&store, job.id).await;
        assert!(warnings.iter().any(|w| w.contains("record not found")));
        assert!(warnings.iter().any(|w| w.contains("not returned by provider")));
        assert!(warnings.iter().any(|w| w.contains("invalid record")));
    }

    #[tokio::test]
    async fn test_cancellation_stops_at_batch_boundary() {
        let store = Arc::new(MemoryStore::new());
        let ids = numbered(6);
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        let job = claimed_job(&store, &ids, "w-1").await;

        let inner = ScriptedProvider::new();
        inner.add_leads(&ids, "OR");
        let provider = Arc::new(CancellingProvider {
            inner,
            store: store.clone(),
            job_id: job.id,
        });

        let outcome = worker(&store, provider.clone(), "w-1", 2)
            .execute(job.clone())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Cancelled);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.processed_records, 2);
        assert_eq!(job.batches_completed, 1);
        assert_eq!(provider.inner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_fails_the_job() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_record_writes(true);
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_leads(&["P-1", "P-2"], "NY");

        let job = claimed_job(&store, &["P-1", "P-2"], "w-1").await;
        let outcome = worker(&store, provider, "w-1", 400)
            .execute(job.clone())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Failed);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.processed_records, 0);
        assert!(job
            .error_details
            .unwrap()
            .contains("could not be persisted"));
    }

    #[tokio::test]
    async fn test_unknown_source_list_fails_the_job() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_job(
                &JobCriteria::SourceList {
                    source_list_id: "gone".to_string(),
                    exclude_ids: vec![],
                },
                "ops",
            )
            .await
            .unwrap();
        let job = store.claim_next_pending("w-1").await.unwrap().unwrap();

        let outcome = worker(&store, Arc::new(ScriptedProvider::new()), "w-1", 10)
            .execute(job.clone())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Failed);
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert!(job.error_details.unwrap().contains("gone"));
    }

    #[tokio::test]
    async fn test_crash_recovery_resumes_after_last_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let ids = numbered(8);
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        let records = Arc::new(ScriptedProvider::new());
        records.add_leads(&ids, "AZ");

        let job = claimed_job(&store, &ids, "w-1").await;
        let crashing = Arc::new(HangingProvider {
            inner: records.clone(),
            calls: AtomicUsize::new(0),
            hang_on: 3,
        });
        let first = worker(&store, crashing, "w-1", 2);
        let crashed = tokio::time::timeout(Duration::from_millis(200), first.execute(job.clone())).await;
        assert!(crashed.is_err());

        let stuck = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Processing);
        assert_eq!(stuck.batches_completed, 2);
        assert_eq!(stuck.processed_records, 4);

        let timeout = Duration::from_secs(900);
        store.backdate_job(job.id, timeout + Duration::from_secs(1));
        assert!(store.mark_stale(job.id, timeout).await.unwrap());

        let resumed = store.claim_next_pending("w-2").await.unwrap().unwrap();
        assert_eq!(resumed.batches_completed, 2);

        let provider = Arc::new(ScriptedProvider::new());
        provider.add_leads(&ids, "AZ");
        let second = worker(&store, provider.clone(), "w-2", 2);
        assert_eq!(second.execute(resumed).await.unwrap(), JobOutcome::Completed);

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec![ExternalId::new("I-5"), ExternalId::new("I-6")]);

        let done = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(done.processed_records, 8);
        assert_eq!(done.success_count, 8);
        assert_eq!(store.record_count(), 8);

        // Replaying an already-committed batch writes nothing new.
        let identifiers_before = store.identifier_count();
        let replay_ids = [ExternalId::new("I-1"), ExternalId::new("I-2")];
        let results = provider.fetch_batch(&replay_ids).await.unwrap();
        let log = JobLog::new(store.clone(), job.id);
        let tally = second
            .process_batch(job.id, &log, &replay_ids, results)
            .await
            .unwrap();
        assert_eq!(tally.success, 2);
        assert_eq!(store.record_count(), 8);
        assert_eq!(store.identifier_count(), identifiers_before);
    }

    #[tokio::test]
    async fn test_released_job_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_leads(&["Q-1"], "ME");

        let job = claimed_job(&store, &["Q-1"], "w-1").await;
        store.backdate_job(job.id, Duration::from_secs(120));
        assert!(store.mark_stale(job.id, Duration::from_secs(60)).await.unwrap());

        let outcome = worker(&store, provider.clone(), "w-1", 10)
            .execute(job.clone())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Released);
        assert!(provider.calls().is_empty());
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_released_worker_cannot_fail_the_new_owners_job() {
        let store = Arc::new(MemoryStore::new());
        let job = claimed_job(&store, &["S-1"], "w-1").await;
        let provider = Arc::new(StealingProvider {
            store: store.clone(),
            job_id: job.id,
            thief: "w-2",
            stolen: AtomicUsize::new(0),
        });

        let mut first = worker(&store, provider, "w-1", 10);
        first.settings.retry.max_attempts = 2;
        let outcome = first.execute(job.clone()).await.unwrap();
        assert_eq!(outcome, JobOutcome::Released);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.claimed_by.as_deref(), Some("w-2"));
        assert!(job.error_details.is_none());
    }

    #[tokio::test]
    async fn test_materialize_failure_fails_the_job() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_materialize(true);
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_leads(&["M-1", "M-2"], "VT");

        let job = claimed_job(&store, &["M-1", "M-2"], "w-1").await;
        let outcome = worker(&store, provider.clone(), "w-1", 10)
            .execute(job.clone())
            .await
            .unwrap();
        assert_eq!(outcome, JobOutcome::Failed);
        assert!(provider.calls().is_empty());

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        let details = job.error_details.unwrap();
        assert!(details.contains("Could not prepare candidates"));
        assert!(details.contains("candidate writes disabled"));
        assert!(store.list_stale(Duration::ZERO).await.unwrap().is_empty());
    }
}
