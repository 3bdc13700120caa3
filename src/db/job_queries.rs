//! Job store queries.
//!
//! Terminal transitions and progress checkpoints lock the job row, run the
//! state-machine rules in [`Job`], then write the result back in the same
//! transaction. Timestamps are written from the database clock, the same
//! clock the stale checks compare against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::db::PgStore;
use crate::models::job::{
    Job, JobCriteria, JobLogEntry, JobStatus, LogLevel, ProgressDelta, Transition,
};
use crate::models::record::ExternalId;
use crate::services::store::{JobStore, ProgressUpdate, StoreError};

const JOB_COLUMNS: &str = "id, status, criteria, total_records, processed_records, success_count, \
     error_count, error_details, batches_completed, materialized, claimed_by, claimed_at, \
     created_by, created_at, updated_at, completed_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    status: String,
    criteria: serde_json::Value,
    total_records: i64,
    processed_records: i64,
    success_count: i64,
    error_count: i64,
    error_details: Option<String>,
    batches_completed: i32,
    materialized: bool,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            status: parse_status(&row.status)?,
            criteria: serde_json::from_value(row.criteria)
                .map_err(|e| StoreError::Corrupt(format!("job {} criteria: {e}", row.id)))?,
            total_records: row.total_records,
            processed_records: row.processed_records,
            success_count: row.success_count,
            error_count: row.error_count,
            error_details: row.error_details,
            batches_completed: row.batches_completed,
            materialized: row.materialized,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    log_id: i64,
    job_id: Uuid,
    level: String,
    message: String,
    timestamp: DateTime<Utc>,
}

impl TryFrom<LogRow> for JobLogEntry {
    type Error = StoreError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        Ok(JobLogEntry {
            log_id: row.log_id,
            job_id: row.job_id,
            level: row
                .level
                .parse::<LogLevel>()
                .map_err(|_| StoreError::Corrupt(format!("unknown log level '{}'", row.level)))?,
            message: row.message,
            timestamp: row.timestamp,
        })
    }
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse::<JobStatus>()
        .map_err(|_| StoreError::Corrupt(format!("unknown job status '{raw}'")))
}

fn rows_to_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
    rows.into_iter().map(Job::try_from).collect()
}

impl PgStore {
    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
    ) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM ingest_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::JobNotFound(job_id))?;

        Job::try_from(row)
    }

    /// Apply a terminal transition. With a `holder`, the job must still be
    /// claimed by that worker.
    async fn finish(
        &self,
        job_id: Uuid,
        holder: Option<&str>,
        target: JobStatus,
        details: Option<&str>,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool().begin().await?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        if let Some(worker_id) = holder {
            if !job.is_held_by(worker_id) {
                return Err(StoreError::ClaimLost {
                    job_id,
                    worker_id: worker_id.to_string(),
                });
            }
        }

        if job.finish(target, details, Utc::now())? == Transition::Applied {
            let row = sqlx::query_as::<_, JobRow>(&format!(
                r#"
                UPDATE ingest_jobs
                SET status = $1, error_details = $2, updated_at = NOW(), completed_at = NOW()
                WHERE id = $3
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(job.status.to_string())
            .bind(&job.error_details)
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
            job = Job::try_from(row)?;
        }

        tx.commit().await?;
        Ok(job)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn create_job(&self, criteria: &JobCriteria, created_by: &str) -> Result<Job, StoreError> {
        let job = Job::new(criteria.clone(), created_by, Utc::now());
        let criteria = serde_json::to_value(&job.criteria)
            .map_err(|e| StoreError::Corrupt(format!("criteria not serializable: {e}")))?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO ingest_jobs (id, status, criteria, created_by, created_at, updated_at)
            VALUES ($1, 'pending', $2, $3, NOW(), NOW())
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(criteria)
        .bind(&job.created_by)
        .fetch_one(self.pool())
        .await?;

        Job::try_from(row)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM ingest_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM ingest_jobs ORDER BY created_at DESC, id DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows_to_jobs(rows)
    }

    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE ingest_jobs
            SET status = 'processing', claimed_by = $1, claimed_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM ingest_jobs
                WHERE status = 'pending'
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn materialize(&self, job_id: Uuid, ids: &[ExternalId]) -> Result<Job, StoreError> {
        let mut tx = self.pool().begin().await?;
        let job = Self::lock_job(&mut tx, job_id).await?;
        if job.materialized {
            tx.commit().await?;
            return Ok(job);
        }

        let raw: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        sqlx::query(
            r#"
            INSERT INTO ingest_job_candidates (job_id, position, external_id)
            SELECT $1, (t.ord - 1)::INTEGER, t.external_id
            FROM UNNEST($2::TEXT[]) WITH ORDINALITY AS t(external_id, ord)
            "#,
        )
        .bind(job_id)
        .bind(&raw)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE ingest_jobs
            SET total_records = $1, materialized = TRUE, updated_at = NOW()
            WHERE id = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(ids.len() as i64)
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Job::try_from(row)
    }

    async fn candidate_ids(&self, job_id: Uuid) -> Result<Vec<ExternalId>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT external_id FROM ingest_job_candidates WHERE job_id = $1 ORDER BY position",
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;

        Ok(ids.into_iter().map(ExternalId::from).collect())
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<JobStatus, StoreError> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE ingest_jobs
            SET updated_at = NOW()
            WHERE id = $1 AND claimed_by = $2 AND status IN ('processing', 'cancelled')
            RETURNING status
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(self.pool())
        .await?;

        match status {
            Some(status) => parse_status(&status),
            None => Err(StoreError::ClaimLost {
                job_id,
                worker_id: worker_id.to_string(),
            }),
        }
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        delta: ProgressDelta,
    ) -> Result<ProgressUpdate, StoreError> {
        let mut tx = self.pool().begin().await?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        if !job.is_held_by(worker_id) {
            return Err(StoreError::ClaimLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }

        let clamped = job.apply_progress(&delta, Utc::now());
        job.updated_at = sqlx::query_scalar(
            r#"
            UPDATE ingest_jobs
            SET processed_records = $1, success_count = $2, error_count = $3,
                batches_completed = $4, updated_at = NOW()
            WHERE id = $5
            RETURNING updated_at
            "#,
        )
        .bind(job.processed_records)
        .bind(job.success_count)
        .bind(job.error_count)
        .bind(job.batches_completed)
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ProgressUpdate { job, clamped })
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<Job, StoreError> {
        self.finish(job_id, Some(worker_id), JobStatus::Completed, None)
            .await
    }

    async fn fail(&self, job_id: Uuid, worker_id: &str, details: &str) -> Result<Job, StoreError> {
        self.finish(job_id, Some(worker_id), JobStatus::Failed, Some(details))
            .await
    }

    async fn cancel(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.finish(job_id, None, JobStatus::Cancelled, None).await
    }

    async fn mark_stale(&self, job_id: Uuid, timeout: Duration) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL, updated_at = NOW()
            WHERE id = $1
              AND status = 'processing'
              AND updated_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(job_id)
        .bind(timeout.as_secs_f64())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_stale(&self, timeout: Duration) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM ingest_jobs
            WHERE status = 'processing' AND updated_at < NOW() - make_interval(secs => $1)
            ORDER BY updated_at
            "#
        ))
        .bind(timeout.as_secs_f64())
        .fetch_all(self.pool())
        .await?;

        rows_to_jobs(rows)
    }

    async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
    ) -> Result<JobLogEntry, StoreError> {
        let row = sqlx::query_as::<_, LogRow>(
            r#"
            INSERT INTO ingest_job_logs (job_id, level, message)
            SELECT $1, $2, $3
            WHERE EXISTS (SELECT 1 FROM ingest_jobs WHERE id = $1)
            RETURNING log_id, job_id, level, message, timestamp
            "#,
        )
        .bind(job_id)
        .bind(level.to_string())
        .bind(message)
        .fetch_optional(self.pool())
        .await?
        .ok_or(StoreError::JobNotFound(job_id))?;

        JobLogEntry::try_from(row)
    }

    async fn job_logs(&self, job_id: Uuid) -> Result<Vec<JobLogEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT log_id, job_id, level, message, timestamp
            FROM ingest_job_logs
            WHERE job_id = $1
            ORDER BY log_id
            "#,
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobLogEntry::try_from).collect()
    }
}
