use async_trait::async_trait;

use crate::db::PgStore;
use crate::services::store::{IdentifierRegistry, StoreError};

#[async_trait]
impl IdentifierRegistry for PgStore {
    async fn register_identifier(&self, identifier: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO record_identifiers (identifier) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(identifier)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
