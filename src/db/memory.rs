//! In-process store
//!
//! Implements every storage port behind a single mutex so each call is
//! atomic, mirroring the row-level guarantees of the PostgreSQL store. Used
//! by tests and local runs without infrastructure.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::models::dnm::{DnmEntry, NewDnmEntry, SubjectQuery, SubjectRef};
use crate::models::job::{Job, JobCriteria, JobLogEntry, JobStatus, LogLevel, ProgressDelta};
use crate::models::record::{
    ExternalId, NewRecord, PersistOutcome, PersistedRecord, PurgeReport, RecordIdentifier,
    RecordMatch, StateCode,
};
use crate::services::store::{
    DnmStore, IdentifierRegistry, JobStore, ProgressUpdate, RecordStore, SequenceSource,
    StoreError,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    /// Creation order, used to break created_at ties when claiming.
    job_order: Vec<Uuid>,
    candidates: HashMap<Uuid, Vec<ExternalId>>,
    logs: Vec<JobLogEntry>,
    records: HashMap<Uuid, PersistedRecord>,
    records_by_external: HashMap<ExternalId, Uuid>,
    job_links: BTreeSet<(Uuid, Uuid)>,
    /// (record_id, campaign date)
    mailings: Vec<(Uuid, NaiveDate)>,
    source_lists: HashMap<String, Vec<ExternalId>>,
    dnm: Vec<DnmEntry>,
    identifiers: HashSet<String>,
    sequences: HashMap<String, u64>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_record_writes: AtomicBool,
    fail_materialize: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a record as if an earlier ingestion had written it.
    pub fn seed_record(&self, external_id: &str, state: &str) -> Uuid {
        let mut inner = self.lock();
        let record_id = Uuid::new_v4();
        let external_id = ExternalId::new(external_id);
        let identifier = format!("O{state}0001-{}", record_id.simple());
        inner.identifiers.insert(identifier.clone());
        inner.records.insert(
            record_id,
            PersistedRecord {
                record_id,
                identifier: RecordIdentifier::from_stored(identifier),
                external_id: external_id.clone(),
                property_type: "other".to_string(),
                address: "seeded".to_string(),
                city: "seeded".to_string(),
                state: state.to_string(),
                zip: "00000".to_string(),
                owner_name: None,
                source_job_id: None,
                created_at: Utc::now(),
            },
        );
        inner.records_by_external.insert(external_id, record_id);
        record_id
    }

    /// Record that a stored record went out in a campaign on `date`.
    pub fn record_mailing(&self, record_id: Uuid, date: NaiveDate) {
        self.lock().mailings.push((record_id, date));
    }

    pub fn add_source_list(&self, list_id: &str, ids: &[&str]) {
        self.lock().source_lists.insert(
            list_id.to_string(),
            ids.iter().map(|id| ExternalId::new(id)).collect(),
        );
    }

    /// Push a job's last update into the past, as if its worker went quiet.
    pub fn backdate_job(&self, job_id: Uuid, by: Duration) {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
            job.updated_at -= by;
        }
    }

    /// Make record inserts fail with a store error.
    pub fn set_fail_record_writes(&self, fail: bool) {
        self.fail_record_writes.store(fail, Ordering::SeqCst);
    }

    /// Make candidate materialization fail with a store error.
    pub fn set_fail_materialize(&self, fail: bool) {
        self.fail_materialize.store(fail, Ordering::SeqCst);
    }

    pub fn record_by_external_id(&self, external_id: &str) -> Option<PersistedRecord> {
        let inner = self.lock();
        inner
            .records_by_external
            .get(&ExternalId::new(external_id))
            .and_then(|id| inner.records.get(id))
            .cloned()
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn identifier_count(&self) -> usize {
        self.lock().identifiers.len()
    }
}

fn job_mut(inner: &mut Inner, job_id: Uuid) -> Result<&mut Job, StoreError> {
    inner
        .jobs
        .get_mut(&job_id)
        .ok_or(StoreError::JobNotFound(job_id))
}

fn finish(
    store: &MemoryStore,
    job_id: Uuid,
    holder: Option<&str>,
    target: JobStatus,
    details: Option<&str>,
) -> Result<Job, StoreError> {
    let mut inner = store.lock();
    let job = job_mut(&mut inner, job_id)?;
    if let Some(worker_id) = holder {
        if !job.is_held_by(worker_id) {
            return Err(StoreError::ClaimLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
    }
    job.finish(target, details, Utc::now())?;
    Ok(job.clone())
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, criteria: &JobCriteria, created_by: &str) -> Result<Job, StoreError> {
        let job = Job::new(criteria.clone(), created_by, Utc::now());
        let mut inner = self.lock();
        inner.job_order.push(job.id);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .job_order
            .iter()
            .rev()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let mut inner = self.lock();
        let next = inner
            .job_order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| job.status == JobStatus::Pending)
            .min_by_key(|job| job.created_at)
            .map(|job| job.id);

        Ok(match next {
            Some(id) => {
                let job = job_mut(&mut inner, id)?;
                job.claim(worker_id, Utc::now());
                Some(job.clone())
            }
            None => None,
        })
    }

    async fn materialize(&self, job_id: Uuid, ids: &[ExternalId]) -> Result<Job, StoreError> {
        if self.fail_materialize.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("candidate writes disabled".to_string()));
        }
        let mut inner = self.lock();
        let job = job_mut(&mut inner, job_id)?;
        if job.materialized {
            return Ok(job.clone());
        }
        job.total_records = ids.len() as i64;
        job.materialized = true;
        job.updated_at = Utc::now();
        let job = job.clone();
        inner.candidates.insert(job_id, ids.to_vec());
        Ok(job)
    }

    async fn candidate_ids(&self, job_id: Uuid) -> Result<Vec<ExternalId>, StoreError> {
        Ok(self
            .lock()
            .candidates
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<JobStatus, StoreError> {
        let mut inner = self.lock();
        let job = job_mut(&mut inner, job_id)?;
        if !job.is_held_by(worker_id) {
            return Err(StoreError::ClaimLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        job.updated_at = Utc::now();
        Ok(job.status)
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        delta: ProgressDelta,
    ) -> Result<ProgressUpdate, StoreError> {
        let mut inner = self.lock();
        let job = job_mut(&mut inner, job_id)?;
        if !job.is_held_by(worker_id) {
            return Err(StoreError::ClaimLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        let clamped = job.apply_progress(&delta, Utc::now());
        Ok(ProgressUpdate {
            job: job.clone(),
            clamped,
        })
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<Job, StoreError> {
        finish(self, job_id, Some(worker_id), JobStatus::Completed, None)
    }

    async fn fail(&self, job_id: Uuid, worker_id: &str, details: &str) -> Result<Job, StoreError> {
        finish(self, job_id, Some(worker_id), JobStatus::Failed, Some(details))
    }

    async fn cancel(&self, job_id: Uuid) -> Result<Job, StoreError> {
        finish(self, job_id, None, JobStatus::Cancelled, None)
    }

    async fn mark_stale(&self, job_id: Uuid, timeout: Duration) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let job = job_mut(&mut inner, job_id)?;
        Ok(job.release_stale(Utc::now(), timeout))
    }

    async fn list_stale(&self, timeout: Duration) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let inner = self.lock();
        Ok(inner
            .job_order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| job.is_stale(now, timeout))
            .cloned()
            .collect())
    }

    async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
    ) -> Result<JobLogEntry, StoreError> {
        let mut inner = self.lock();
        if !inner.jobs.contains_key(&job_id) {
            return Err(StoreError::JobNotFound(job_id));
        }
        let entry = JobLogEntry {
            log_id: inner.logs.len() as i64 + 1,
            job_id,
            level,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        inner.logs.push(entry.clone());
        Ok(entry)
    }

    async fn job_logs(&self, job_id: Uuid) -> Result<Vec<JobLogEntry>, StoreError> {
        Ok(self
            .lock()
            .logs
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn lookup_records(&self, ids: &[ExternalId]) -> Result<Vec<RecordMatch>, StoreError> {
        let inner = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let record_id = *inner.records_by_external.get(id)?;
                let last_campaign_date = inner
                    .mailings
                    .iter()
                    .filter(|(mailed, _)| *mailed == record_id)
                    .map(|(_, date)| *date)
                    .max();
                Some(RecordMatch {
                    external_id: id.clone(),
                    record_id,
                    last_campaign_date,
                })
            })
            .collect())
    }

    async fn source_list(&self, list_id: &str) -> Result<Option<Vec<ExternalId>>, StoreError> {
        Ok(self.lock().source_lists.get(list_id).cloned())
    }

    async fn insert_record(&self, record: NewRecord) -> Result<PersistOutcome, StoreError> {
        if self.fail_record_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("record writes disabled".to_string()));
        }

        let mut inner = self.lock();
        if let Some(&record_id) = inner.records_by_external.get(&record.external_id) {
            inner.job_links.insert((record.job_id, record_id));
            return Ok(PersistOutcome::AlreadyPresent { record_id });
        }
        if !inner.identifiers.contains(record.identifier.as_str()) {
            return Err(StoreError::Corrupt(format!(
                "identifier {} was never registered",
                record.identifier
            )));
        }

        let persisted = PersistedRecord {
            record_id: Uuid::new_v4(),
            identifier: record.identifier,
            external_id: record.external_id.clone(),
            property_type: record.lead.property_type,
            address: record.lead.address,
            city: record.lead.city,
            state: record.state.to_string(),
            zip: record.lead.zip,
            owner_name: record.lead.owner_name,
            source_job_id: Some(record.job_id),
            created_at: Utc::now(),
        };
        inner
            .records_by_external
            .insert(record.external_id, persisted.record_id);
        inner.records.insert(persisted.record_id, persisted.clone());
        inner.job_links.insert((record.job_id, persisted.record_id));
        Ok(PersistOutcome::Inserted(persisted))
    }

    async fn link_record(&self, job_id: Uuid, record_id: Uuid) -> Result<(), StoreError> {
        if self.fail_record_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("record writes disabled".to_string()));
        }
        self.lock().job_links.insert((job_id, record_id));
        Ok(())
    }

    async fn job_records(&self, job_id: Uuid) -> Result<Vec<PersistedRecord>, StoreError> {
        let inner = self.lock();
        let mut records: Vec<PersistedRecord> = inner
            .job_links
            .iter()
            .filter(|(linked_job, _)| *linked_job == job_id)
            .filter_map(|(_, record_id)| inner.records.get(record_id).cloned())
            .collect();
        records.sort_by(|a, b| a.identifier.as_str().cmp(b.identifier.as_str()));
        Ok(records)
    }

    async fn purge_state(
        &self,
        state: &StateCode,
        confirm: bool,
    ) -> Result<PurgeReport, StoreError> {
        let mut inner = self.lock();
        let doomed: HashSet<Uuid> = inner
            .records
            .values()
            .filter(|record| record.state == state.as_str())
            .map(|record| record.record_id)
            .collect();

        let report = PurgeReport {
            state: state.to_string(),
            records: doomed.len() as u64,
            mail_recipients: inner
                .mailings
                .iter()
                .filter(|(record_id, _)| doomed.contains(record_id))
                .count() as u64,
            job_links: inner
                .job_links
                .iter()
                .filter(|(_, record_id)| doomed.contains(record_id))
                .count() as u64,
            deleted: confirm,
        };

        if confirm {
            inner.mailings.retain(|(record_id, _)| !doomed.contains(record_id));
            inner.job_links.retain(|(_, record_id)| !doomed.contains(record_id));
            inner.records.retain(|record_id, _| !doomed.contains(record_id));
            inner
                .records_by_external
                .retain(|_, record_id| !doomed.contains(record_id));
        }
        Ok(report)
    }
}

#[async_trait]
impl DnmStore for MemoryStore {
    async fn insert_dnm_entry(&self, entry: &NewDnmEntry) -> Result<DnmEntry, StoreError> {
        let stored = DnmEntry {
            id: Uuid::new_v4(),
            subject: entry.subject.clone(),
            reason: entry.reason.clone(),
            reason_category: entry.reason_category,
            source: entry.source.clone(),
            blocked_at: Utc::now(),
            active: true,
            deactivated_at: None,
        };
        self.lock().dnm.push(stored.clone());
        Ok(stored)
    }

    async fn deactivate_dnm_entry(&self, entry_id: Uuid) -> Result<Option<DnmEntry>, StoreError> {
        let mut inner = self.lock();
        Ok(inner
            .dnm
            .iter_mut()
            .find(|entry| entry.id == entry_id)
            .map(|entry| {
                if entry.active {
                    entry.active = false;
                    entry.deactivated_at = Some(Utc::now());
                }
                entry.clone()
            }))
    }

    async fn active_dnm_entries(&self, query: &SubjectQuery) -> Result<Vec<DnmEntry>, StoreError> {
        Ok(self
            .lock()
            .dnm
            .iter()
            .filter(|entry| entry.active && entry.matches(query))
            .cloned()
            .collect())
    }

    async fn dnm_history(&self, subject: &SubjectRef) -> Result<Vec<DnmEntry>, StoreError> {
        let query = subject.to_query();
        Ok(self
            .lock()
            .dnm
            .iter()
            .filter(|entry| entry.matches(&query))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IdentifierRegistry for MemoryStore {
    async fn register_identifier(&self, identifier: &str) -> Result<bool, StoreError> {
        Ok(self.lock().identifiers.insert(identifier.to_string()))
    }
}

#[async_trait]
impl SequenceSource for MemoryStore {
    async fn next_sequence(&self, bucket: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let counter = inner.sequences.entry(bucket.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}
