use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::{JobLogEntry, LogLevel};
use crate::services::store::JobStore;

/// Progress log for one job. Each message is emitted as a tracing event and
/// appended to the job's persisted log.
#[derive(Clone)]
pub struct JobLog {
    jobs: Arc<dyn JobStore>,
    job_id: Uuid,
}

impl JobLog {
    pub fn new(jobs: Arc<dyn JobStore>, job_id: Uuid) -> Self {
        Self { jobs, job_id }
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        self.append(LogLevel::Info, message.as_ref()).await;
    }

    pub async fn warning(&self, message: impl AsRef<str>) {
        self.append(LogLevel::Warning, message.as_ref()).await;
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.append(LogLevel::Error, message.as_ref()).await;
    }

    /// A failed append is reported through tracing only; it never fails the job.
    async fn append(&self, level: LogLevel, message: &str) -> Option<JobLogEntry> {
        match level {
            LogLevel::Info => tracing::info!(job_id = %self.job_id, "{message}"),
            LogLevel::Warning => tracing::warn!(job_id = %self.job_id, "{message}"),
            LogLevel::Error => tracing::error!(job_id = %self.job_id, "{message}"),
        }

        match self.jobs.append_log(self.job_id, level, message).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Failed to append job log entry");
                None
            }
        }
    }
}
