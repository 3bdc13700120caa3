use async_trait::async_trait;
use redis::AsyncCommands;

use crate::services::store::{SequenceSource, StoreError};

const SEQUENCE_KEY_PREFIX: &str = "lead_ingest:seq:";

/// Buckets cover one ISO week; keep the counter around well past that.
const SEQUENCE_TTL_SECS: i64 = 60 * 60 * 24 * 60;

/// Redis-backed identifier sequence counters shared by every worker.
pub struct RedisSequence {
    client: redis::Client,
}

impl RedisSequence {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl SequenceSource for RedisSequence {
    /// `INCR` on the bucket key; the first value handed out is 1.
    async fn next_sequence(&self, bucket: &str) -> Result<u64, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("{SEQUENCE_KEY_PREFIX}{bucket}");

        let value: u64 = conn.incr(&key, 1u64).await?;
        if value == 1 {
            conn.expire::<_, ()>(&key, SEQUENCE_TTL_SECS).await?;
        }
        Ok(value)
    }
}
