use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::record::ExternalId;

/// Duplicate classification of a candidate external id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    New,
    DuplicateUnmailed,
    DuplicateMailed,
}

/// A candidate id after duplicate (and optionally DNM) resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub external_id: ExternalId,
    pub record_id: Option<Uuid>,
    pub classification: Classification,
    /// Only set for `DuplicateMailed`.
    pub last_campaign_date: Option<NaiveDate>,
    #[serde(default)]
    pub dnm_blocked: bool,
}

impl CandidateRecord {
    pub fn new_lead(external_id: ExternalId) -> Self {
        Self {
            external_id,
            record_id: None,
            classification: Classification::New,
            last_campaign_date: None,
            dnm_blocked: false,
        }
    }
}

/// Body of a candidate preview request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub criteria: crate::models::job::CriteriaInput,
    #[serde(default)]
    pub exclude_all_duplicates: bool,
    pub exclude_mailed_within_days: Option<u32>,
}
