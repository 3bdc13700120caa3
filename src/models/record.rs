use chrono::{DateTime, Datelike, NaiveDate, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lead identifier assigned by the external lead-data provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    /// Build an id from raw input, trimming surrounding whitespace.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ExternalId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Two-letter US state code, always uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StateCode(String);

impl StateCode {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let code = raw.trim().to_ascii_uppercase();
        if code.len() == 2 && code.chars().all(|c| c.is_ascii_uppercase()) {
            Ok(Self(code))
        } else {
            Err(format!("'{raw}' is not a two-letter state code"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StateCode {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<StateCode> for String {
    fn from(code: StateCode) -> Self {
        code.0
    }
}

impl fmt::Display for StateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Property classification, which supplies the identifier type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum RecordType {
    #[strum(serialize = "single_family", serialize = "sfr")]
    SingleFamily,
    #[strum(serialize = "multi_family", serialize = "mfr")]
    MultiFamily,
    Condo,
    Land,
    Other,
}

impl RecordType {
    /// Map a provider property-type label, treating anything unknown as `Other`.
    pub fn from_property_type(raw: &str) -> Self {
        raw.trim()
            .replace([' ', '-'], "_")
            .parse()
            .unwrap_or(RecordType::Other)
    }

    pub fn code(self) -> char {
        match self {
            RecordType::SingleFamily => 'S',
            RecordType::MultiFamily => 'M',
            RecordType::Condo => 'C',
            RecordType::Land => 'L',
            RecordType::Other => 'O',
        }
    }
}

/// Globally-unique record identifier: `[Type][State][YY][Week]-[Sequence]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordIdentifier(String);

impl RecordIdentifier {
    /// Wrap an identifier read back from the registry.
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type/state/year/week bucket that identifiers are minted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierPrefix(String);

impl IdentifierPrefix {
    /// Year and week follow ISO-8601 week numbering.
    pub fn new(record_type: RecordType, state: &StateCode, at: DateTime<Utc>) -> Self {
        let week = at.iso_week();
        Self(format!(
            "{}{}{:02}{:02}",
            record_type.code(),
            state,
            week.year().rem_euclid(100),
            week.week()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn with_sequence(&self, sequence: u64) -> RecordIdentifier {
        RecordIdentifier(format!("{}-{:06}", self.0, sequence))
    }

    pub fn with_suffix(&self, suffix: &str) -> RecordIdentifier {
        RecordIdentifier(format!("{}-{}", self.0, suffix))
    }
}

/// Property/owner record as returned by the lead-data provider.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LeadRecord {
    #[garde(length(min = 1, max = 50))]
    pub property_type: String,

    #[garde(length(min = 1, max = 200))]
    pub address: String,

    #[garde(length(min = 1, max = 100))]
    pub city: String,

    #[garde(custom(valid_state))]
    pub state: String,

    #[garde(length(min = 5, max = 10))]
    pub zip: String,

    #[garde(length(min = 1, max = 200))]
    pub owner_name: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub payload: serde_json::Value,
}

fn valid_state(value: &str, _context: &()) -> garde::Result {
    StateCode::parse(value).map(|_| ()).map_err(garde::Error::new)
}

/// Record about to be written by the worker.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub external_id: ExternalId,
    pub identifier: RecordIdentifier,
    pub job_id: Uuid,
    pub state: StateCode,
    pub lead: LeadRecord,
}

/// Record as stored, in the shape export consumers read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub record_id: Uuid,
    pub identifier: RecordIdentifier,
    pub external_id: ExternalId,
    pub property_type: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub owner_name: Option<String>,
    pub source_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Result of writing a record. Writing an external id that already exists
/// leaves the stored record untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Inserted(PersistedRecord),
    AlreadyPresent { record_id: Uuid },
}

/// One stored record matching a candidate external id, with the latest date
/// it was mailed in any campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMatch {
    pub external_id: ExternalId,
    pub record_id: Uuid,
    pub last_campaign_date: Option<NaiveDate>,
}

/// Row counts touched by a state purge.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PurgeReport {
    pub state: String,
    pub records: u64,
    pub mail_recipients: u64,
    pub job_links: u64,
    pub deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_state_code_normalizes_case() {
        assert_eq!(StateCode::parse(" ca ").unwrap().as_str(), "CA");
        assert!(StateCode::parse("CAL").is_err());
        assert!(StateCode::parse("C1").is_err());
    }

    #[test]
    fn test_record_type_from_provider_labels() {
        assert_eq!(RecordType::from_property_type("Single Family"), RecordType::SingleFamily);
        assert_eq!(RecordType::from_property_type("SFR"), RecordType::SingleFamily);
        assert_eq!(RecordType::from_property_type("multi-family"), RecordType::MultiFamily);
        assert_eq!(RecordType::from_property_type("CONDO"), RecordType::Condo);
        assert_eq!(RecordType::from_property_type("houseboat"), RecordType::Other);
    }

    #[test]
    fn test_identifier_prefix_uses_iso_week() {
        let state = StateCode::parse("CA").unwrap();
        // 2027-01-01 falls in ISO week 53 of 2026.
        let at = Utc.with_ymd_and_hms(2027, 1, 1, 12, 0, 0).unwrap();
        let prefix = IdentifierPrefix::new(RecordType::SingleFamily, &state, at);
        assert_eq!(prefix.as_str(), "SCA2653");
        assert_eq!(prefix.with_sequence(42).as_str(), "SCA2653-000042");
    }

    #[test]
    fn test_lead_record_validation() {
        let mut lead = LeadRecord {
            property_type: "single_family".to_string(),
            address: "12 Palm Way".to_string(),
            city: "Fresno".to_string(),
            state: "CA".to_string(),
            zip: "93650".to_string(),
            owner_name: Some("J. Doe".to_string()),
            payload: serde_json::Value::Null,
        };
        assert!(lead.validate().is_ok());

        lead.state = "California".to_string();
        assert!(lead.validate().is_err());
    }
}
