//! HTTP helpers for end-to-end tests against a running API and worker

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Job read model returned by the jobs endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: String,
    pub total_records: i64,
    pub processed_records: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub error_details: Option<String>,
    pub created_by: String,
}

/// Entry from GET /api/v1/jobs/{id}/logs
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_id: i64,
    pub job_id: Uuid,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DnmCheck {
    pub id: String,
    pub blocked: bool,
    pub reason: Option<String>,
}

/// Submit a job over an explicit id list
pub async fn submit_job(
    client: &reqwest::Client,
    base_url: &str,
    include_ids: &[String],
    exclude_ids: &[String],
) -> Result<JobView, Box<dyn std::error::Error>> {
    let body = serde_json::json!({
        "criteria": { "includeIds": include_ids, "excludeIds": exclude_ids },
        "createdBy": "e2e-tests",
    });

    let response = client
        .post(format!("{}/api/v1/jobs", base_url))
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if status != reqwest::StatusCode::CREATED {
        let error_text = response.text().await?;
        return Err(format!("Submission failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<JobView>().await?)
}

/// Poll a job until it reaches a terminal status (with timeout)
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
    timeout_secs: u64,
) -> Result<JobView, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms
    let mut last_processed = 0;

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/jobs/{}", base_url, job_id))
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(format!("Status check failed: {}", error_text).into());
        }

        let job = response.json::<JobView>().await?;
        if job.processed_records < last_processed {
            return Err(format!(
                "processed_records went backwards: {} -> {}",
                last_processed, job.processed_records
            )
            .into());
        }
        last_processed = job.processed_records;

        match job.status.as_str() {
            "completed" | "failed" | "cancelled" => return Ok(job),
            "pending" | "processing" => {
                if attempt % 10 == 0 && attempt > 0 {
                    println!(
                        "  ... {}/{} processed (attempt {}/{})",
                        job.processed_records, job.total_records, attempt, max_attempts
                    );
                }
                sleep(Duration::from_millis(500)).await;
            }
            other => return Err(format!("Unknown job status: {}", other).into()),
        }
    }

    Err(format!("Job did not finish within {} seconds", timeout_secs).into())
}

pub async fn fetch_logs(
    client: &reqwest::Client,
    base_url: &str,
    job_id: Uuid,
) -> Result<Vec<LogEntry>, Box<dyn std::error::Error>> {
    let response = client
        .get(format!("{}/api/v1/jobs/{}/logs", base_url, job_id))
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json::<Vec<LogEntry>>().await?)
}

/// Check the invariants every finished job must satisfy
pub fn assert_job_consistent(job: &JobView) {
    assert!(
        job.processed_records <= job.total_records,
        "processed {} exceeds total {} for job {}",
        job.processed_records,
        job.total_records,
        job.job_id
    );
    assert_eq!(
        job.success_count + job.error_count,
        job.processed_records,
        "success + error must equal processed for job {}",
        job.job_id
    );
}
