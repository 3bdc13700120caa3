//! Record identifier minting
//!
//! Identifiers have the shape `[Type][State][YY][Week]-[Sequence]`. The
//! sequence comes from a store-backed counter and every candidate is
//! registered in the identifier table before use, so concurrent minters in
//! separate processes never hand out the same identifier. When the counter
//! keeps colliding (or is unreachable) a random suffix is used instead.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::models::record::{IdentifierPrefix, RecordIdentifier, RecordType, StateCode};
use crate::services::store::{IdentifierRegistry, SequenceSource, StoreError};

/// Registration attempts made with random suffixes after the sequence path
/// is exhausted.
const FALLBACK_ATTEMPTS: u32 = 3;

const FALLBACK_SUFFIX_LEN: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum IdentifierError {
    #[error("Identifier registry failure: {0}")]
    Registry(#[from] StoreError),

    #[error("Could not mint a unique identifier in bucket {0}")]
    Exhausted(String),
}

pub struct IdentifierGenerator {
    registry: Arc<dyn IdentifierRegistry>,
    sequence: Arc<dyn SequenceSource>,
    max_attempts: u32,
}

impl IdentifierGenerator {
    pub fn new(
        registry: Arc<dyn IdentifierRegistry>,
        sequence: Arc<dyn SequenceSource>,
        max_attempts: u32,
    ) -> Self {
        Self {
            registry,
            sequence,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn generate(
        &self,
        record_type: RecordType,
        state: &StateCode,
    ) -> Result<RecordIdentifier, IdentifierError> {
        self.generate_at(record_type, state, Utc::now()).await
    }

    pub async fn generate_at(
        &self,
        record_type: RecordType,
        state: &StateCode,
        at: DateTime<Utc>,
    ) -> Result<RecordIdentifier, IdentifierError> {
        let prefix = IdentifierPrefix::new(record_type, state, at);

        for attempt in 1..=self.max_attempts {
            let sequence = match self.sequence.next_sequence(prefix.as_str()).await {
                Ok(sequence) => sequence,
                Err(e) => {
                    warn!(bucket = prefix.as_str(), error = %e, "Sequence counter unavailable, using fallback suffix");
                    break;
                }
            };

            let candidate = prefix.with_sequence(sequence);
            if self.registry.register_identifier(candidate.as_str()).await? {
                return Ok(candidate);
            }

            warn!(
                identifier = candidate.as_str(),
                attempt,
                max_attempts = self.max_attempts,
                "Identifier collision, retrying with a fresh sequence"
            );
        }

        for _ in 0..FALLBACK_ATTEMPTS {
            let candidate = prefix.with_suffix(&fallback_suffix());
            if self.registry.register_identifier(candidate.as_str()).await? {
                return Ok(candidate);
            }
        }

        Err(IdentifierError::Exhausted(prefix.as_str().to_string()))
    }
}

/// Uppercase hex taken from a fresh v4 UUID.
fn fallback_suffix() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(FALLBACK_SUFFIX_LEN);
    suffix.make_ascii_uppercase();
    suffix
}
