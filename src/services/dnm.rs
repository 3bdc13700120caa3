//! Do-not-mail registry guard
//!
//! Consulted at candidate preview, at persistence inside the worker, and at
//! export. Every check reads the registry; nothing is cached.

use garde::Validate;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::IngestError;
use crate::models::dnm::{DnmCheck, DnmEntry, NewDnmEntry, SubjectQuery, SubjectRef};
use crate::models::record::ExternalId;
use crate::services::store::{DnmStore, StoreError};

pub struct DnmGuard {
    store: Arc<dyn DnmStore>,
}

impl DnmGuard {
    pub fn new(store: Arc<dyn DnmStore>) -> Self {
        Self { store }
    }

    pub async fn is_blocked(&self, subject: &SubjectRef) -> Result<bool, StoreError> {
        if subject.is_empty() {
            return Ok(false);
        }
        let active = self.store.active_dnm_entries(&subject.to_query()).await?;
        Ok(!active.is_empty())
    }

    pub async fn add(&self, entry: NewDnmEntry) -> Result<DnmEntry, IngestError> {
        entry.validate()?;
        if entry.subject.is_empty() {
            return Err(IngestError::Validation(
                "a DNM entry needs an external id, record id or loan reference".to_string(),
            ));
        }

        let stored = self.store.insert_dnm_entry(&entry).await?;
        tracing::info!(
            entry_id = %stored.id,
            category = %stored.reason_category,
            source = %stored.source,
            "Added do-not-mail entry"
        );
        Ok(stored)
    }

    /// Returns `None` for an unknown entry id. Deactivating twice is a no-op.
    pub async fn deactivate(&self, entry_id: Uuid) -> Result<Option<DnmEntry>, StoreError> {
        let entry = self.store.deactivate_dnm_entry(entry_id).await?;
        if entry.is_some() {
            tracing::info!(entry_id = %entry_id, "Deactivated do-not-mail entry");
        }
        Ok(entry)
    }

    pub async fn history(&self, subject: &SubjectRef) -> Result<Vec<DnmEntry>, StoreError> {
        self.store.dnm_history(subject).await
    }

    /// Blocking reason per external id, in one registry read. `record_ids`
    /// maps ids that already have a stored record, so entries keyed by
    /// record id are honored too.
    pub async fn blocked_reasons(
        &self,
        ids: &[ExternalId],
        record_ids: &HashMap<ExternalId, Uuid>,
    ) -> Result<HashMap<ExternalId, String>, StoreError> {
        let query = SubjectQuery {
            external_ids: ids.to_vec(),
            record_ids: record_ids.values().copied().collect(),
            loan_refs: Vec::new(),
        };
        if query.is_empty() {
            return Ok(HashMap::new());
        }

        let by_record: HashMap<Uuid, &ExternalId> =
            record_ids.iter().map(|(ext, rec)| (*rec, ext)).collect();

        let mut entries = self.store.active_dnm_entries(&query).await?;
        entries.sort_by_key(|entry| entry.blocked_at);

        let mut blocked = HashMap::new();
        for entry in entries {
            let by_external = entry
                .subject
                .external_id
                .as_ref()
                .filter(|id| ids.contains(id));
            let by_record_id = entry
                .subject
                .record_id
                .and_then(|id| by_record.get(&id).copied());

            for id in by_external.into_iter().chain(by_record_id) {
                blocked
                    .entry(id.clone())
                    .or_insert_with(|| entry.reason.clone());
            }
        }
        Ok(blocked)
    }

    pub async fn check_batch(&self, ids: &[ExternalId]) -> Result<Vec<DnmCheck>, StoreError> {
        let blocked = self.blocked_reasons(ids, &HashMap::new()).await?;
        Ok(ids
            .iter()
            .map(|id| {
                let reason = blocked.get(id).cloned();
                DnmCheck {
                    id: id.clone(),
                    blocked: reason.is_some(),
                    reason,
                }
            })
            .collect())
    }
}
