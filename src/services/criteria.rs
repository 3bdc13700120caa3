//! Expansion of job criteria into the ordered candidate id set.

use std::collections::HashSet;

use crate::error::IngestError;
use crate::models::job::JobCriteria;
use crate::models::record::ExternalId;
use crate::services::store::RecordStore;

/// Exact-key exclusion lookup. Ids are compared after trimming, never by
/// substring.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    ids: HashSet<ExternalId>,
}

impl ExclusionSet {
    pub fn new(ids: &[ExternalId]) -> Self {
        Self {
            ids: ids
                .iter()
                .map(|id| ExternalId::new(id.as_str()))
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, id: &ExternalId) -> bool {
        self.ids.contains(id)
    }
}

/// Resolve criteria to candidate ids: the include list or saved source list,
/// minus the exclusion set, de-duplicated in first-seen order.
pub async fn expand(
    records: &dyn RecordStore,
    criteria: &JobCriteria,
) -> Result<Vec<ExternalId>, IngestError> {
    let included = match criteria {
        JobCriteria::RecordIdList { include_ids, .. } => include_ids.clone(),
        JobCriteria::SourceList { source_list_id, .. } => records
            .source_list(source_list_id)
            .await?
            .ok_or_else(|| {
                IngestError::Validation(format!("source list '{source_list_id}' does not exist"))
            })?,
    };

    let excluded = ExclusionSet::new(criteria.exclude_ids());
    let mut seen = HashSet::with_capacity(included.len());

    Ok(included
        .into_iter()
        .map(|id| ExternalId::new(id.as_str()))
        .filter(|id| !id.is_empty() && !excluded.contains(id))
        .filter(|id| seen.insert(id.clone()))
        .collect())
}
