//! End-to-end tests against a deployed API and worker
//!
//! These tests require:
//! 1. PostgreSQL database running (with migrations applied)
//! 2. Redis running
//! 3. API server running on configured port
//! 4. Worker process running, pointed at a sandbox lead provider that serves
//!    the fixture ids
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:3000)

mod fixtures;
mod helpers;

use fixtures::*;
use helpers::*;
use uuid::Uuid;

/// Get base URL from env or default to localhost
fn get_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_health_check() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_job_runs_to_completion() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let mut ids = fixture_ids();
    ids.extend(REJECTED_IDS.iter().map(|id| id.to_string()));
    let excluded = vec![LEAD_FIXTURES[0].external_id.to_string()];

    let job = submit_job(&client, &base_url, &ids, &excluded)
        .await
        .expect("Failed to submit job");
    assert_eq!(job.status, "pending");
    println!("Submitted job {}", job.job_id);

    let job = poll_job_status(&client, &base_url, job.job_id, 300)
        .await
        .expect("Job did not finish");

    assert_eq!(job.status, "completed", "error_details: {:?}", job.error_details);
    assert_eq!(job.total_records, (ids.len() - excluded.len()) as i64);
    assert_eq!(job.processed_records, job.total_records);
    assert!(job.error_count >= REJECTED_IDS.len() as i64);
    assert_job_consistent(&job);

    let logs = fetch_logs(&client, &base_url, job.job_id)
        .await
        .expect("Failed to fetch logs");
    assert!(!logs.is_empty());
    assert!(logs.windows(2).all(|w| w[0].log_id < w[1].log_id));
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_malformed_criteria_rejected() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/jobs", base_url))
        .json(&serde_json::json!({
            "criteria": { "includeIds": ["A"], "sourceListId": "list-1" },
            "createdBy": "e2e-tests",
        }))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let response = client
        .get(format!("{}/api/v1/jobs/{}", base_url, Uuid::new_v4()))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_dnm_blocks_before_ingestion() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let blocked_id = format!("E2E-DNM-{}", Uuid::new_v4().simple());

    let response = client
        .post(format!("{}/api/v1/dnm", base_url))
        .json(&serde_json::json!({
            "subject": { "externalId": blocked_id },
            "reason": "owner asked to be removed",
            "reasonCategory": "owner_request",
            "source": "e2e-tests",
        }))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);

    let checks: Vec<DnmCheck> = client
        .post(format!("{}/api/v1/dnm/check", base_url))
        .json(&serde_json::json!({ "ids": [blocked_id, "E2E-CLEAN"] }))
        .send()
        .await
        .expect("Request failed")
        .json()
        .await
        .expect("Invalid check response");

    assert!(checks[0].blocked);
    assert_eq!(checks[0].reason.as_deref(), Some("owner asked to be removed"));
    assert!(!checks[1].blocked);
}
