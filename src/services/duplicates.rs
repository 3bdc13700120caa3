//! Duplicate classification of candidate ids against stored records and
//! their mailing history.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::candidate::{CandidateRecord, Classification};
use crate::models::record::ExternalId;
use crate::services::store::{RecordStore, StoreError};

pub struct DuplicateResolver {
    records: Arc<dyn RecordStore>,
    chunk_size: usize,
}

impl DuplicateResolver {
    pub fn new(records: Arc<dyn RecordStore>, chunk_size: usize) -> Self {
        Self {
            records,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Classify every id. Lookups go out `chunk_size` ids at a time.
    pub async fn resolve(
        &self,
        ids: &[ExternalId],
    ) -> Result<HashMap<ExternalId, CandidateRecord>, StoreError> {
        let mut resolved: HashMap<ExternalId, CandidateRecord> = ids
            .iter()
            .map(|id| (id.clone(), CandidateRecord::new_lead(id.clone())))
            .collect();

        for chunk in ids.chunks(self.chunk_size) {
            for found in self.records.lookup_records(chunk).await? {
                if let Some(candidate) = resolved.get_mut(&found.external_id) {
                    candidate.record_id = Some(found.record_id);
                    candidate.last_campaign_date = found.last_campaign_date;
                    candidate.classification = match found.last_campaign_date {
                        Some(_) => Classification::DuplicateMailed,
                        None => Classification::DuplicateUnmailed,
                    };
                }
            }
        }

        Ok(resolved)
    }
}

/// Keep only ids with no stored record.
pub fn exclude_all_duplicates(candidates: Vec<CandidateRecord>) -> Vec<CandidateRecord> {
    candidates
        .into_iter()
        .filter(|c| c.classification == Classification::New)
        .collect()
}

/// Drop records mailed within the last `days` days. A record last mailed
/// exactly `days` ago is dropped too; only strictly older mailings are kept.
pub fn exclude_mailed_within_days(
    candidates: Vec<CandidateRecord>,
    days: u32,
    today: NaiveDate,
) -> Vec<CandidateRecord> {
    let cutoff = today - chrono::Duration::days(i64::from(days));
    candidates
        .into_iter()
        .filter(|c| match (c.classification, c.last_campaign_date) {
            (Classification::DuplicateMailed, Some(last)) => last < cutoff,
            _ => true,
        })
        .collect()
}
