use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::record::ExternalId;

/// Status of an ingestion job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Forward edges of the state machine. Stale recovery
    /// (processing -> pending) is handled separately by [`Job::release_stale`].
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Cancelled)
        )
    }
}

/// What a job ingests. Closed so the worker handles every shape exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobCriteria {
    RecordIdList {
        include_ids: Vec<ExternalId>,
        #[serde(default)]
        exclude_ids: Vec<ExternalId>,
    },
    SourceList {
        source_list_id: String,
        #[serde(default)]
        exclude_ids: Vec<ExternalId>,
    },
}

impl JobCriteria {
    pub fn exclude_ids(&self) -> &[ExternalId] {
        match self {
            JobCriteria::RecordIdList { exclude_ids, .. } => exclude_ids,
            JobCriteria::SourceList { exclude_ids, .. } => exclude_ids,
        }
    }
}

/// Criteria as submitted by clients.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CriteriaInput {
    #[garde(length(max = 250000))]
    pub include_ids: Option<Vec<String>>,

    #[garde(length(max = 250000))]
    pub exclude_ids: Option<Vec<String>>,

    #[garde(length(min = 1, max = 100))]
    pub source_list_id: Option<String>,
}

impl TryFrom<CriteriaInput> for JobCriteria {
    type Error = String;

    fn try_from(input: CriteriaInput) -> Result<Self, Self::Error> {
        let exclude_ids = normalize_ids(input.exclude_ids.unwrap_or_default(), "excludeIds")?;
        let include_ids = normalize_ids(input.include_ids.unwrap_or_default(), "includeIds")?;

        match input.source_list_id {
            Some(_) if !include_ids.is_empty() => {
                Err("criteria may name includeIds or sourceListId, not both".to_string())
            }
            Some(list) => {
                let source_list_id = list.trim().to_string();
                if source_list_id.is_empty() {
                    return Err("sourceListId must not be blank".to_string());
                }
                Ok(JobCriteria::SourceList {
                    source_list_id,
                    exclude_ids,
                })
            }
            None if include_ids.is_empty() => {
                Err("criteria must name includeIds or a sourceListId".to_string())
            }
            None => Ok(JobCriteria::RecordIdList {
                include_ids,
                exclude_ids,
            }),
        }
    }
}

fn normalize_ids(raw: Vec<String>, field: &str) -> Result<Vec<ExternalId>, String> {
    raw.into_iter()
        .enumerate()
        .map(|(index, value)| {
            let id = ExternalId::new(&value);
            if id.is_empty() || id.as_str().len() > 64 {
                Err(format!("{field}[{index}] is not a valid external id"))
            } else {
                Ok(id)
            }
        })
        .collect()
}

/// Body of a job submission.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[garde(dive)]
    pub criteria: CriteriaInput,

    #[garde(length(min = 1, max = 100))]
    pub created_by: String,
}

/// A bulk ingestion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub criteria: JobCriteria,
    pub total_records: i64,
    pub processed_records: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub error_details: Option<String>,
    pub batches_completed: i32,
    pub materialized: bool,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Counters accumulated by one batch, applied as a single checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressDelta {
    pub processed: i64,
    pub success: i64,
    pub error: i64,
    pub batch_index: i32,
}

/// Outcome of a terminal transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The job was already terminal; nothing changed.
    Unchanged,
}

impl Job {
    pub fn new(criteria: JobCriteria, created_by: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            criteria,
            total_records: 0,
            processed_records: 0,
            success_count: 0,
            error_count: 0,
            error_details: None,
            batches_completed: 0,
            materialized: false,
            claimed_by: None,
            claimed_at: None,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Whether `worker_id` may still write progress for this job. A job
    /// cancelled mid-run stays writable by its worker until the current
    /// batch checkpoint lands.
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        matches!(self.status, JobStatus::Processing | JobStatus::Cancelled)
            && self.claimed_by.as_deref() == Some(worker_id)
    }

    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.claimed_by = Some(worker_id.to_string());
        self.claimed_at = Some(now);
        self.updated_at = now;
    }

    /// Add one batch worth of counters. Returns `true` when processed_records
    /// had to be clamped to total_records.
    pub fn apply_progress(&mut self, delta: &ProgressDelta, now: DateTime<Utc>) -> bool {
        let wanted = self.processed_records + delta.processed.max(0);
        let clamped = wanted > self.total_records;
        self.processed_records = wanted.min(self.total_records);
        self.success_count += delta.success.max(0);
        self.error_count += delta.error.max(0);
        self.batches_completed = self.batches_completed.max(delta.batch_index + 1);
        self.updated_at = now;
        clamped
    }

    /// Move to a terminal status. Repeating a terminal transition, or asking
    /// for a different terminal status once terminal, changes nothing.
    pub fn finish(
        &mut self,
        target: JobStatus,
        error_details: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Transition, InvalidTransition> {
        if self.status.is_terminal() {
            return Ok(Transition::Unchanged);
        }
        if !self.status.can_transition_to(target) {
            return Err(InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        if let Some(details) = error_details {
            self.error_details = Some(details.to_string());
        }
        self.updated_at = now;
        self.completed_at = Some(now);
        Ok(Transition::Applied)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let idle = now.signed_duration_since(self.updated_at);
        self.status == JobStatus::Processing
            && idle.to_std().map(|idle| idle > timeout).unwrap_or(false)
    }

    /// Hand a stale job back to the queue. Progress and the batch checkpoint
    /// are kept so the next worker resumes where this one stopped.
    pub fn release_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if !self.is_stale(now, timeout) {
            return false;
        }
        self.status = JobStatus::Pending;
        self.claimed_by = None;
        self.claimed_at = None;
        self.updated_at = now;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub job_id: Uuid,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Job read model exposed to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total_records: i64,
    pub processed_records: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub error_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            total_records: job.total_records,
            processed_records: job.processed_records,
            success_count: job.success_count,
            error_count: job.error_count,
            error_details: job.error_details.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
            created_by: job.created_by.clone(),
        }
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Append-only progress log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub log_id: i64,
    pub job_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
