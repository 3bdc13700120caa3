//! Error taxonomy of the ingestion pipeline.

use crate::models::record::ExternalId;
use crate::services::identifier::IdentifierError;
use crate::services::provider::ProviderError;
use crate::services::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Malformed submission; no job is created.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// One record of a batch could not be fetched or was malformed.
    #[error("Record {id} rejected: {reason}")]
    RecordFetch { id: ExternalId, reason: String },

    /// The provider could not serve a whole batch.
    #[error("Provider transport failure: {0}")]
    BatchTransport(#[from] ProviderError),

    /// A store write failed.
    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("Identifier minting failed: {0}")]
    Identifier(#[from] IdentifierError),

    /// Attempt to persist a subject with an active do-not-mail entry.
    #[error("Record {0} is on the do-not-mail registry")]
    ComplianceViolation(ExternalId),
}

impl IngestError {
    /// Record-level errors are counted against the job and never abort it.
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            IngestError::RecordFetch { .. } | IngestError::ComplianceViolation(_)
        )
    }
}

impl From<garde::Report> for IngestError {
    fn from(report: garde::Report) -> Self {
        IngestError::Validation(report.to_string())
    }
}
