use serde::Deserialize;
use std::time::Duration;

use crate::services::scheduler::SchedulerSettings;
use crate::services::worker::{RetryPolicy, WorkerSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus scrape address of the worker process
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for identifier sequence counters
    pub redis_url: String,

    /// Base URL of the lead-data provider API
    pub provider_base_url: String,

    /// Bearer token for the lead-data provider
    pub provider_api_key: String,

    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Ids fetched from the provider per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Ids per duplicate lookup query
    #[serde(default = "default_lookup_chunk_size")]
    pub lookup_chunk_size: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A processing job with no update for this long is returned to pending
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,

    #[serde(default = "default_stale_sweep_interval_secs")]
    pub stale_sweep_interval_secs: u64,

    /// Fetch attempts per batch, first try included
    #[serde(default = "default_max_batch_attempts")]
    pub max_batch_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Pause between batches to stay under provider rate limits
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,

    /// Identifier minting attempts before a record is given up on
    #[serde(default = "default_id_max_attempts")]
    pub id_max_attempts: u32,

    /// Worker identity recorded on claimed jobs. Generated when unset.
    #[serde(default)]
    pub worker_id: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    400
}

fn default_lookup_chunk_size() -> usize {
    500
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stale_timeout_secs() -> u64 {
    900
}

fn default_stale_sweep_interval_secs() -> u64 {
    60
}

fn default_max_batch_attempts() -> u32 {
    4
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_inter_batch_delay_ms() -> u64 {
    250
}

fn default_id_max_attempts() -> u32 {
    5
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let worker_id = self
            .worker_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()));

        WorkerSettings {
            worker_id,
            batch_size: self.batch_size.max(1),
            inter_batch_delay: Duration::from_millis(self.inter_batch_delay_ms),
            retry: RetryPolicy {
                max_attempts: self.max_batch_attempts.max(1),
                base_delay: Duration::from_millis(self.retry_base_ms),
                max_delay: Duration::from_millis(self.retry_max_ms),
            },
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stale_timeout: self.stale_timeout(),
            sweep_interval: Duration::from_secs(self.stale_sweep_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Vec<(String, String)> {
        [
            ("DATABASE_URL", "postgres://localhost/leads"),
            ("REDIS_URL", "redis://localhost"),
            ("PROVIDER_BASE_URL", "https://provider.test"),
            ("PROVIDER_API_KEY", "secret"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = envy::from_iter(required()).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.batch_size, 400);
        assert_eq!(config.lookup_chunk_size, 500);
        assert_eq!(config.stale_timeout(), Duration::from_secs(900));

        let worker = config.worker_settings();
        assert!(worker.worker_id.starts_with("worker-"));
        assert_eq!(worker.retry.max_attempts, 4);
        assert_eq!(worker.retry.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_and_missing_fields() {
        let mut vars = required();
        vars.push(("BATCH_SIZE".to_string(), "50".to_string()));
        vars.push(("WORKER_ID".to_string(), "ingest-a".to_string()));
        let config: AppConfig = envy::from_iter(vars).unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.worker_settings().worker_id, "ingest-a");

        let partial = required().into_iter().skip(1);
        assert!(envy::from_iter::<_, AppConfig>(partial).is_err());
    }
}
