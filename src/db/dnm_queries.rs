use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::PgStore;
use crate::models::dnm::{DnmEntry, NewDnmEntry, ReasonCategory, SubjectQuery, SubjectRef};
use crate::models::record::ExternalId;
use crate::services::store::{DnmStore, StoreError};

const DNM_COLUMNS: &str = "id, external_id, record_id, loan_ref, reason, reason_category, source, \
     blocked_at, active, deactivated_at";

#[derive(sqlx::FromRow)]
struct DnmRow {
    id: Uuid,
    external_id: Option<String>,
    record_id: Option<Uuid>,
    loan_ref: Option<String>,
    reason: String,
    reason_category: String,
    source: String,
    blocked_at: DateTime<Utc>,
    active: bool,
    deactivated_at: Option<DateTime<Utc>>,
}

impl TryFrom<DnmRow> for DnmEntry {
    type Error = StoreError;

    fn try_from(row: DnmRow) -> Result<Self, Self::Error> {
        let reason_category = row.reason_category.parse::<ReasonCategory>().map_err(|_| {
            StoreError::Corrupt(format!("unknown DNM category '{}'", row.reason_category))
        })?;

        Ok(DnmEntry {
            id: row.id,
            subject: SubjectRef {
                external_id: row.external_id.map(ExternalId::from),
                record_id: row.record_id,
                loan_ref: row.loan_ref,
            },
            reason: row.reason,
            reason_category,
            source: row.source,
            blocked_at: row.blocked_at,
            active: row.active,
            deactivated_at: row.deactivated_at,
        })
    }
}

fn rows_to_entries(rows: Vec<DnmRow>) -> Result<Vec<DnmEntry>, StoreError> {
    rows.into_iter().map(DnmEntry::try_from).collect()
}

/// `$1` external ids, `$2` record ids, `$3` loan references.
const MATCHES_SUBJECT: &str =
    "(external_id = ANY($1) OR record_id = ANY($2) OR loan_ref = ANY($3))";

fn query_binds(query: &SubjectQuery) -> (Vec<String>, Vec<Uuid>, Vec<String>) {
    (
        query
            .external_ids
            .iter()
            .map(|id| id.as_str().to_string())
            .collect(),
        query.record_ids.clone(),
        query.loan_refs.clone(),
    )
}

#[async_trait]
impl DnmStore for PgStore {
    async fn insert_dnm_entry(&self, entry: &NewDnmEntry) -> Result<DnmEntry, StoreError> {
        let row = sqlx::query_as::<_, DnmRow>(&format!(
            r#"
            INSERT INTO dnm_entries (id, external_id, record_id, loan_ref, reason,
                                     reason_category, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {DNM_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(entry.subject.external_id.as_ref().map(|id| id.as_str()))
        .bind(entry.subject.record_id)
        .bind(&entry.subject.loan_ref)
        .bind(&entry.reason)
        .bind(entry.reason_category.to_string())
        .bind(&entry.source)
        .fetch_one(self.pool())
        .await?;

        DnmEntry::try_from(row)
    }

    async fn deactivate_dnm_entry(&self, entry_id: Uuid) -> Result<Option<DnmEntry>, StoreError> {
        let row = sqlx::query_as::<_, DnmRow>(&format!(
            r#"
            UPDATE dnm_entries
            SET active = FALSE, deactivated_at = COALESCE(deactivated_at, NOW())
            WHERE id = $1
            RETURNING {DNM_COLUMNS}
            "#
        ))
        .bind(entry_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(DnmEntry::try_from).transpose()
    }

    async fn active_dnm_entries(&self, query: &SubjectQuery) -> Result<Vec<DnmEntry>, StoreError> {
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let (external_ids, record_ids, loan_refs) = query_binds(query);
        let rows = sqlx::query_as::<_, DnmRow>(&format!(
            "SELECT {DNM_COLUMNS} FROM dnm_entries WHERE active AND {MATCHES_SUBJECT}"
        ))
        .bind(&external_ids)
        .bind(&record_ids)
        .bind(&loan_refs)
        .fetch_all(self.pool())
        .await?;

        rows_to_entries(rows)
    }

    async fn dnm_history(&self, subject: &SubjectRef) -> Result<Vec<DnmEntry>, StoreError> {
        let (external_ids, record_ids, loan_refs) = query_binds(&subject.to_query());
        let rows = sqlx::query_as::<_, DnmRow>(&format!(
            "SELECT {DNM_COLUMNS} FROM dnm_entries WHERE {MATCHES_SUBJECT} ORDER BY blocked_at, id"
        ))
        .bind(&external_ids)
        .bind(&record_ids)
        .bind(&loan_refs)
        .fetch_all(self.pool())
        .await?;

        rows_to_entries(rows)
    }
}
