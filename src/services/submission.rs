//! Job submission and the candidate preview shown before a job is created.

use chrono::Utc;
use garde::Validate;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::IngestError;
use crate::models::candidate::{CandidateRecord, Classification, PreviewRequest};
use crate::models::job::{CreateJobRequest, Job, JobCriteria, JobStatus};
use crate::models::record::ExternalId;
use crate::services::criteria;
use crate::services::dnm::DnmGuard;
use crate::services::duplicates::{self, DuplicateResolver};
use crate::services::progress::JobLog;
use crate::services::store::{JobStore, RecordStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreviewSummary {
    pub total: usize,
    pub new: usize,
    pub duplicate_unmailed: usize,
    pub duplicate_mailed: usize,
    pub dnm_blocked: usize,
    /// Dropped by the duplicate filters on the request.
    pub filtered_out: usize,
    pub candidates: Vec<CandidateRecord>,
}

pub struct SubmissionService {
    jobs: Arc<dyn JobStore>,
    records: Arc<dyn RecordStore>,
    resolver: DuplicateResolver,
    dnm: Arc<DnmGuard>,
}

impl SubmissionService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        records: Arc<dyn RecordStore>,
        dnm: Arc<DnmGuard>,
        lookup_chunk_size: usize,
    ) -> Self {
        Self {
            jobs,
            resolver: DuplicateResolver::new(records.clone(), lookup_chunk_size),
            records,
            dnm,
        }
    }

    /// Validate and persist a new PENDING job. Nothing is written when the
    /// request is rejected.
    pub async fn submit(&self, req: CreateJobRequest) -> Result<Job, IngestError> {
        req.validate()?;
        let created_by = req.created_by.trim().to_string();
        let criteria = JobCriteria::try_from(req.criteria).map_err(IngestError::Validation)?;

        if let JobCriteria::SourceList { source_list_id, .. } = &criteria {
            if self.records.source_list(source_list_id).await?.is_none() {
                return Err(IngestError::Validation(format!(
                    "source list '{source_list_id}' does not exist"
                )));
            }
        }

        let job = self.jobs.create_job(&criteria, &created_by).await?;
        metrics::counter!("ingest_jobs_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            created_by = %job.created_by,
            "Ingestion job submitted"
        );
        Ok(job)
    }

    /// Request cancellation. A job that is already terminal is returned
    /// unchanged and its log is left alone.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, IngestError> {
        let before = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        let job = self.jobs.cancel(job_id).await?;

        if !before.status.is_terminal() && job.status == JobStatus::Cancelled {
            JobLog::new(self.jobs.clone(), job_id)
                .info("Cancellation requested")
                .await;
        }
        Ok(job)
    }

    /// Classify the ids a job with these criteria would ingest and flag the
    /// ones on the do-not-mail registry.
    pub async fn preview(&self, req: PreviewRequest) -> Result<PreviewSummary, IngestError> {
        req.criteria.validate()?;
        let criteria = JobCriteria::try_from(req.criteria).map_err(IngestError::Validation)?;
        let ids = criteria::expand(self.records.as_ref(), &criteria).await?;

        let mut resolved = self.resolver.resolve(&ids).await?;
        let record_ids: HashMap<ExternalId, _> = resolved
            .values()
            .filter_map(|c| c.record_id.map(|r| (c.external_id.clone(), r)))
            .collect();
        let blocked = self.dnm.blocked_reasons(&ids, &record_ids).await?;

        let candidates: Vec<CandidateRecord> = ids
            .iter()
            .filter_map(|id| resolved.remove(id))
            .map(|mut c| {
                c.dnm_blocked = blocked.contains_key(&c.external_id);
                c
            })
            .collect();

        let mut summary = PreviewSummary {
            total: candidates.len(),
            ..Default::default()
        };
        for candidate in &candidates {
            match candidate.classification {
                Classification::New => summary.new += 1,
                Classification::DuplicateUnmailed => summary.duplicate_unmailed += 1,
                Classification::DuplicateMailed => summary.duplicate_mailed += 1,
            }
            if candidate.dnm_blocked {
                summary.dnm_blocked += 1;
            }
        }

        let mut kept = candidates;
        if req.exclude_all_duplicates {
            kept = duplicates::exclude_all_duplicates(kept);
        }
        if let Some(days) = req.exclude_mailed_within_days {
            kept = duplicates::exclude_mailed_within_days(kept, days, Utc::now().date_naive());
        }
        summary.filtered_out = summary.total - kept.len();
        summary.candidates = kept;

        tracing::debug!(
            total = summary.total,
            duplicates = summary.duplicate_mailed + summary.duplicate_unmailed,
            dnm_blocked = summary.dnm_blocked,
            "Candidate preview computed"
        );
        Ok(summary)
    }
}
