//! Export of a completed job's records for campaign use.
//!
//! Records whose subject is on the do-not-mail registry are withheld unless
//! the operator named them in the remail override set.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::JobStatus;
use crate::models::record::{ExternalId, PersistedRecord};
use crate::services::dnm::DnmGuard;
use crate::services::store::{JobStore, RecordStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error("Job {job_id} is {status}; only completed jobs can be exported")]
    NotCompleted { job_id: Uuid, status: JobStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportBatch {
    pub job_id: Uuid,
    pub records: Vec<PersistedRecord>,
    /// Blocked and withheld.
    pub suppressed: Vec<ExternalId>,
    /// Blocked but exported on operator override.
    pub overridden: Vec<ExternalId>,
}

pub struct Exporter {
    jobs: Arc<dyn JobStore>,
    records: Arc<dyn RecordStore>,
    dnm: Arc<DnmGuard>,
}

impl Exporter {
    pub fn new(jobs: Arc<dyn JobStore>, records: Arc<dyn RecordStore>, dnm: Arc<DnmGuard>) -> Self {
        Self { jobs, records, dnm }
    }

    pub async fn export(
        &self,
        job_id: Uuid,
        remail_overrides: &[ExternalId],
    ) -> Result<ExportBatch, ExportError> {
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(ExportError::NotFound(job_id))?;
        if job.status != JobStatus::Completed {
            return Err(ExportError::NotCompleted {
                job_id,
                status: job.status,
            });
        }

        let records = self.records.job_records(job_id).await?;
        let ids: Vec<ExternalId> = records.iter().map(|r| r.external_id.clone()).collect();
        let known: HashMap<ExternalId, Uuid> = records
            .iter()
            .map(|r| (r.external_id.clone(), r.record_id))
            .collect();
        let blocked = self.dnm.blocked_reasons(&ids, &known).await?;
        let overrides: HashSet<&ExternalId> = remail_overrides.iter().collect();

        let mut batch = ExportBatch {
            job_id,
            records: Vec::with_capacity(records.len()),
            suppressed: Vec::new(),
            overridden: Vec::new(),
        };
        for record in records {
            if blocked.contains_key(&record.external_id) {
                if overrides.contains(&record.external_id) {
                    batch.overridden.push(record.external_id.clone());
                } else {
                    batch.suppressed.push(record.external_id);
                    continue;
                }
            }
            batch.records.push(record);
        }

        tracing::info!(
            job_id = %job_id,
            exported = batch.records.len(),
            suppressed = batch.suppressed.len(),
            overridden = batch.overridden.len(),
            "Exported job records"
        );
        Ok(batch)
    }
}
