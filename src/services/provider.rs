//! Lead-data provider client
//!
//! Fetches property/owner records by external id in batches. A batch call
//! reports per-id failures alongside successes; only transport-level
//! problems fail the call as a whole.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::models::record::{ExternalId, LeadRecord};

/// Outcome for one requested id.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub id: ExternalId,
    pub outcome: Result<LeadRecord, String>,
}

impl FetchResult {
    pub fn ok(id: impl Into<ExternalId>, record: LeadRecord) -> Self {
        Self {
            id: id.into(),
            outcome: Ok(record),
        }
    }

    pub fn err(id: impl Into<ExternalId>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: Err(reason.into()),
        }
    }
}

#[async_trait]
pub trait LeadProvider: Send + Sync {
    async fn fetch_batch(&self, ids: &[ExternalId]) -> Result<Vec<FetchResult>, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request to provider failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider rate limit hit")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider returned HTTP {status}")]
    Unavailable {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("Failed to decode provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Wait hint supplied by the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            ProviderError::Unavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    ids: &'a [ExternalId],
}

#[derive(Deserialize)]
struct BatchResponse {
    results: Vec<WireResult>,
}

#[derive(Deserialize)]
struct WireResult {
    id: ExternalId,
    record: Option<serde_json::Value>,
    error: Option<String>,
}

/// HTTP client for the lead-data provider's batch endpoint.
pub struct LeadProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl LeadProviderClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("lead-ingest/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl LeadProvider for LeadProviderClient {
    async fn fetch_batch(&self, ids: &[ExternalId]) -> Result<Vec<FetchResult>, ProviderError> {
        let url = format!("{}/v1/properties/batch", self.base_url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&BatchRequest { ids })
            .send()
            .await?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(ProviderError::Unavailable {
                status: status.as_u16(),
                retry_after,
            });
        }

        let body = response.text().await?;
        decode_results(&body)
    }
}

/// `Retry-After` in delay-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Decode a batch body. Records that fail to decode become per-id errors.
fn decode_results(body: &str) -> Result<Vec<FetchResult>, ProviderError> {
    let response: BatchResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))?;

    Ok(response
        .results
        .into_iter()
        .map(|item| {
            let outcome = match (item.record, item.error) {
                (_, Some(error)) => Err(error),
                (Some(raw), None) => serde_json::from_value::<LeadRecord>(raw.clone())
                    .map(|mut lead| {
                        lead.payload = raw;
                        lead
                    })
                    .map_err(|e| format!("malformed record: {e}")),
                (None, None) => Err("provider returned neither record nor error".to_string()),
            };
            FetchResult {
                id: item.id,
                outcome,
            }
        })
        .collect())
}

/// Provider serving canned records from memory, with scripted transport
/// failures. Ids it has no record for are left out of the response.
#[derive(Default)]
pub struct ScriptedProvider {
    state: Mutex<ScriptState>,
}

#[derive(Default)]
struct ScriptState {
    records: HashMap<ExternalId, Result<LeadRecord, String>>,
    /// Remaining failures for any call that requests the id.
    failures: HashMap<ExternalId, u32>,
    calls: Vec<Vec<ExternalId>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_lead(&self, id: &str, lead: LeadRecord) {
        self.lock().records.insert(ExternalId::new(id), Ok(lead));
    }

    /// Serve a plain single-family record in `state` for each id.
    pub fn add_leads(&self, ids: &[&str], state: &str) {
        for id in ids {
            self.add_lead(id, sample_lead(id, state));
        }
    }

    pub fn add_error(&self, id: &str, reason: &str) {
        self.lock()
            .records
            .insert(ExternalId::new(id), Err(reason.to_string()));
    }

    /// Fail the next `times` calls that request `id` with a 503.
    pub fn fail_batches_containing(&self, id: &str, times: u32) {
        self.lock().failures.insert(ExternalId::new(id), times);
    }

    /// Ids requested by each call so far.
    pub fn calls(&self) -> Vec<Vec<ExternalId>> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl LeadProvider for ScriptedProvider {
    async fn fetch_batch(&self, ids: &[ExternalId]) -> Result<Vec<FetchResult>, ProviderError> {
        let mut state = self.lock();
        state.calls.push(ids.to_vec());

        let failing = ids
            .iter()
            .find(|id| state.failures.get(*id).is_some_and(|left| *left > 0))
            .cloned();
        if let Some(id) = failing {
            if let Some(left) = state.failures.get_mut(&id) {
                *left -= 1;
            }
            return Err(ProviderError::Unavailable {
                status: 503,
                retry_after: None,
            });
        }

        Ok(ids
            .iter()
            .filter_map(|id| {
                let outcome = state.records.get(id)?.clone();
                Some(FetchResult {
                    id: id.clone(),
                    outcome,
                })
            })
            .collect())
    }
}

/// A valid single-family lead located in `state`.
pub fn sample_lead(id: &str, state: &str) -> LeadRecord {
    LeadRecord {
        property_type: "single_family".to_string(),
        address: format!("{id} Harbor Rd"),
        city: "Springfield".to_string(),
        state: state.to_string(),
        zip: "62704".to_string(),
        owner_name: Some(format!("Owner of {id}")),
        payload: serde_json::json!({ "source_id": id }),
    }
}
