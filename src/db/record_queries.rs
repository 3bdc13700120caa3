use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::db::PgStore;
use crate::models::record::{
    ExternalId, NewRecord, PersistOutcome, PersistedRecord, PurgeReport, RecordIdentifier,
    RecordMatch, StateCode,
};
use crate::services::store::{RecordStore, StoreError};

const RECORD_COLUMNS: &str = "record_id, identifier, external_id, property_type, address, city, \
     state, zip, owner_name, source_job_id, created_at";

#[derive(sqlx::FromRow)]
struct RecordRow {
    record_id: Uuid,
    identifier: String,
    external_id: String,
    property_type: String,
    address: String,
    city: String,
    state: String,
    zip: String,
    owner_name: Option<String>,
    source_job_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<RecordRow> for PersistedRecord {
    fn from(row: RecordRow) -> Self {
        PersistedRecord {
            record_id: row.record_id,
            identifier: RecordIdentifier::from_stored(row.identifier),
            external_id: ExternalId::from(row.external_id),
            property_type: row.property_type,
            address: row.address,
            city: row.city,
            state: row.state,
            zip: row.zip,
            owner_name: row.owner_name,
            source_job_id: row.source_job_id,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MatchRow {
    external_id: String,
    record_id: Uuid,
    last_campaign_date: Option<NaiveDate>,
}

const IN_STATE: &str = "SELECT record_id FROM properties WHERE state = $1";

#[async_trait]
impl RecordStore for PgStore {
    async fn lookup_records(&self, ids: &[ExternalId]) -> Result<Vec<RecordMatch>, StoreError> {
        let raw: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, MatchRow>(
            r#"
            SELECT p.external_id, p.record_id, MAX(c.campaign_date) AS last_campaign_date
            FROM properties p
            LEFT JOIN mail_recipients mr ON mr.record_id = p.record_id
            LEFT JOIN campaigns c ON c.id = mr.campaign_id
            WHERE p.external_id = ANY($1)
            GROUP BY p.external_id, p.record_id
            "#,
        )
        .bind(&raw)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RecordMatch {
                external_id: ExternalId::from(row.external_id),
                record_id: row.record_id,
                last_campaign_date: row.last_campaign_date,
            })
            .collect())
    }

    async fn source_list(&self, list_id: &str) -> Result<Option<Vec<ExternalId>>, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM source_lists WHERE id = $1)")
                .bind(list_id)
                .fetch_one(self.pool())
                .await?;
        if !exists {
            return Ok(None);
        }

        let members: Vec<String> = sqlx::query_scalar(
            "SELECT external_id FROM source_list_members WHERE list_id = $1 ORDER BY position",
        )
        .bind(list_id)
        .fetch_all(self.pool())
        .await?;

        Ok(Some(members.into_iter().map(ExternalId::from).collect()))
    }

    async fn insert_record(&self, record: NewRecord) -> Result<PersistOutcome, StoreError> {
        let mut tx = self.pool().begin().await?;

        let inserted = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            INSERT INTO properties (record_id, external_id, identifier, property_type, address,
                                    city, state, zip, owner_name, payload, source_job_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (external_id) DO NOTHING
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(record.external_id.as_str())
        .bind(record.identifier.as_str())
        .bind(&record.lead.property_type)
        .bind(&record.lead.address)
        .bind(&record.lead.city)
        .bind(record.state.as_str())
        .bind(&record.lead.zip)
        .bind(&record.lead.owner_name)
        .bind(&record.lead.payload)
        .bind(record.job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match inserted {
            Some(row) => PersistOutcome::Inserted(row.into()),
            None => {
                let record_id: Uuid =
                    sqlx::query_scalar("SELECT record_id FROM properties WHERE external_id = $1")
                        .bind(record.external_id.as_str())
                        .fetch_one(&mut *tx)
                        .await?;
                PersistOutcome::AlreadyPresent { record_id }
            }
        };

        let record_id = match &outcome {
            PersistOutcome::Inserted(persisted) => persisted.record_id,
            PersistOutcome::AlreadyPresent { record_id } => *record_id,
        };
        sqlx::query(
            "INSERT INTO ingest_job_records (job_id, record_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(record.job_id)
        .bind(record_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn link_record(&self, job_id: Uuid, record_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ingest_job_records (job_id, record_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(job_id)
        .bind(record_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn job_records(&self, job_id: Uuid) -> Result<Vec<PersistedRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT p.record_id, p.identifier, p.external_id, p.property_type, p.address, p.city,
                   p.state, p.zip, p.owner_name, p.source_job_id, p.created_at
            FROM ingest_job_records jr
            JOIN properties p ON p.record_id = jr.record_id
            WHERE jr.job_id = $1
            ORDER BY p.identifier
            "#,
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(PersistedRecord::from).collect())
    }

    /// Children are removed before their parents. Identifiers stay
    /// registered and DNM entries are left alone.
    async fn purge_state(
        &self,
        state: &StateCode,
        confirm: bool,
    ) -> Result<PurgeReport, StoreError> {
        let mut tx = self.pool().begin().await?;

        let count = |table: &str| {
            format!("SELECT COUNT(*) FROM {table} WHERE record_id IN ({IN_STATE})")
        };
        let mail_recipients: i64 = sqlx::query_scalar(&count("mail_recipients"))
            .bind(state.as_str())
            .fetch_one(&mut *tx)
            .await?;
        let job_links: i64 = sqlx::query_scalar(&count("ingest_job_records"))
            .bind(state.as_str())
            .fetch_one(&mut *tx)
            .await?;
        let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM properties WHERE state = $1")
            .bind(state.as_str())
            .fetch_one(&mut *tx)
            .await?;

        if confirm {
            for table in ["mail_recipients", "ingest_job_records"] {
                sqlx::query(&format!(
                    "DELETE FROM {table} WHERE record_id IN ({IN_STATE})"
                ))
                .bind(state.as_str())
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query("DELETE FROM properties WHERE state = $1")
                .bind(state.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(PurgeReport {
            state: state.to_string(),
            records: records as u64,
            mail_recipients: mail_recipients as u64,
            job_links: job_links as u64,
            deleted: confirm,
        })
    }
}
