use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::record::ExternalId;

/// Why a subject was placed on the do-not-mail registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReasonCategory {
    OwnerRequest,
    Deceased,
    Litigation,
    Bankruptcy,
    Fraud,
    Regulatory,
    Other,
}

/// The subject of a DNM entry. At least one reference must be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRef {
    pub external_id: Option<ExternalId>,
    pub record_id: Option<Uuid>,
    pub loan_ref: Option<String>,
}

impl SubjectRef {
    pub fn external(id: ExternalId) -> Self {
        Self {
            external_id: Some(id),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.external_id.as_ref().map_or(true, |id| id.is_empty())
            && self.record_id.is_none()
            && self.loan_ref.as_deref().map_or(true, |r| r.trim().is_empty())
    }

    pub fn to_query(&self) -> SubjectQuery {
        SubjectQuery {
            external_ids: self.external_id.iter().cloned().collect(),
            record_ids: self.record_id.iter().copied().collect(),
            loan_refs: self.loan_ref.iter().cloned().collect(),
        }
    }
}

/// Batch lookup keys; an entry matches if any of its references is listed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubjectQuery {
    pub external_ids: Vec<ExternalId>,
    pub record_ids: Vec<Uuid>,
    pub loan_refs: Vec<String>,
}

impl SubjectQuery {
    pub fn external_ids(ids: &[ExternalId]) -> Self {
        Self {
            external_ids: ids.to_vec(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.external_ids.is_empty() && self.record_ids.is_empty() && self.loan_refs.is_empty()
    }
}

/// One registry entry. Entries are deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnmEntry {
    pub id: Uuid,
    pub subject: SubjectRef,
    pub reason: String,
    pub reason_category: ReasonCategory,
    pub source: String,
    pub blocked_at: DateTime<Utc>,
    pub active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl DnmEntry {
    pub fn matches(&self, query: &SubjectQuery) -> bool {
        let subject = &self.subject;
        subject
            .external_id
            .as_ref()
            .is_some_and(|id| query.external_ids.contains(id))
            || subject
                .record_id
                .is_some_and(|id| query.record_ids.contains(&id))
            || subject
                .loan_ref
                .as_ref()
                .is_some_and(|r| query.loan_refs.contains(r))
    }
}

/// Body of a DNM add request.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewDnmEntry {
    #[garde(skip)]
    pub subject: SubjectRef,

    #[garde(length(min = 1, max = 500))]
    pub reason: String,

    #[garde(skip)]
    pub reason_category: ReasonCategory,

    #[garde(length(min = 1, max = 100))]
    pub source: String,
}

/// Per-id answer of a DNM batch check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnmCheck {
    pub id: ExternalId,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
