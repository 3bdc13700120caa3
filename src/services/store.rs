//! Storage ports used by the ingestion pipeline.
//!
//! `db::PgStore` implements these against PostgreSQL; `db::memory::MemoryStore`
//! implements them in-process. Every method is a single atomic operation on
//! the backing store.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::models::dnm::{DnmEntry, NewDnmEntry, SubjectQuery, SubjectRef};
use crate::models::job::{
    InvalidTransition, Job, JobCriteria, JobLogEntry, JobStatus, LogLevel, ProgressDelta,
};
use crate::models::record::{
    ExternalId, NewRecord, PersistOutcome, PersistedRecord, PurgeReport, RecordMatch, StateCode,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Job {job_id} is no longer held by worker {worker_id}")]
    ClaimLost { job_id: Uuid, worker_id: String },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result of a progress checkpoint.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job: Job,
    /// processed_records would have exceeded total_records and was clamped.
    pub clamped: bool,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, criteria: &JobCriteria, created_by: &str) -> Result<Job, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Most recent jobs first.
    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// Atomically move the oldest pending job to processing under `worker_id`.
    /// Concurrent callers never receive the same job.
    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<Job>, StoreError>;

    /// Persist the ordered candidate id set and total_records. A job that is
    /// already materialized is returned unchanged.
    async fn materialize(&self, job_id: Uuid, ids: &[ExternalId]) -> Result<Job, StoreError>;

    async fn candidate_ids(&self, job_id: Uuid) -> Result<Vec<ExternalId>, StoreError>;

    /// Refresh the job's liveness and return its current status, failing with
    /// `ClaimLost` once `worker_id` no longer holds it.
    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<JobStatus, StoreError>;

    async fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        delta: ProgressDelta,
    ) -> Result<ProgressUpdate, StoreError>;

    /// Worker-side terminal transitions. Both fail with `ClaimLost` once
    /// `worker_id` no longer holds the job; a job cancelled under its worker
    /// is returned unchanged.
    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<Job, StoreError>;

    async fn fail(&self, job_id: Uuid, worker_id: &str, details: &str)
        -> Result<Job, StoreError>;

    /// Operator cancellation; applies whoever holds the job.
    async fn cancel(&self, job_id: Uuid) -> Result<Job, StoreError>;

    async fn is_cancelled(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        Ok(job.status == JobStatus::Cancelled)
    }

    /// Return a processing job to pending if it has not been updated within
    /// `timeout`. Returns whether the job was released.
    async fn mark_stale(&self, job_id: Uuid, timeout: Duration) -> Result<bool, StoreError>;

    async fn list_stale(&self, timeout: Duration) -> Result<Vec<Job>, StoreError>;

    async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
    ) -> Result<JobLogEntry, StoreError>;

    /// Entries in insertion order.
    async fn job_logs(&self, job_id: Uuid) -> Result<Vec<JobLogEntry>, StoreError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stored records for the given external ids with their latest mailing date.
    async fn lookup_records(&self, ids: &[ExternalId]) -> Result<Vec<RecordMatch>, StoreError>;

    /// Members of a saved source list in list order, or `None` if the list
    /// does not exist.
    async fn source_list(&self, list_id: &str) -> Result<Option<Vec<ExternalId>>, StoreError>;

    /// Insert a record and link it to its job. An external id that already
    /// exists is linked instead of inserted.
    async fn insert_record(&self, record: NewRecord) -> Result<PersistOutcome, StoreError>;

    async fn link_record(&self, job_id: Uuid, record_id: Uuid) -> Result<(), StoreError>;

    /// Every record linked to a job.
    async fn job_records(&self, job_id: Uuid) -> Result<Vec<PersistedRecord>, StoreError>;

    /// Count, and when `confirm` is set delete, all records in one state.
    async fn purge_state(&self, state: &StateCode, confirm: bool)
        -> Result<PurgeReport, StoreError>;
}

#[async_trait]
pub trait DnmStore: Send + Sync {
    async fn insert_dnm_entry(&self, entry: &NewDnmEntry) -> Result<DnmEntry, StoreError>;

    async fn deactivate_dnm_entry(&self, entry_id: Uuid) -> Result<Option<DnmEntry>, StoreError>;

    async fn active_dnm_entries(&self, query: &SubjectQuery) -> Result<Vec<DnmEntry>, StoreError>;

    /// Active and inactive entries for one subject, oldest first.
    async fn dnm_history(&self, subject: &SubjectRef) -> Result<Vec<DnmEntry>, StoreError>;
}

#[async_trait]
pub trait IdentifierRegistry: Send + Sync {
    /// Record `identifier` as used. Returns `false` if it was already taken.
    async fn register_identifier(&self, identifier: &str) -> Result<bool, StoreError>;
}

/// Store-backed atomic counter per identifier bucket.
#[async_trait]
pub trait SequenceSource: Send + Sync {
    async fn next_sequence(&self, bucket: &str) -> Result<u64, StoreError>;
}
