use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for every pipeline metric. Called once by each
/// binary after the recorder is installed.
pub fn describe_metrics() {
    metrics::describe_counter!("ingest_jobs_total", "Ingestion jobs submitted");
    metrics::describe_counter!("ingest_jobs_completed", "Ingestion jobs completed");
    metrics::describe_counter!("ingest_jobs_failed", "Ingestion jobs that failed");
    metrics::describe_counter!("ingest_records_persisted", "Lead records written");
    metrics::describe_counter!(
        "ingest_records_rejected",
        "Records counted as errors (fetch failures, invalid, do-not-mail)"
    );
    metrics::describe_histogram!(
        "ingest_batch_seconds",
        "Time to fetch and persist one batch"
    );
    metrics::describe_counter!("ingest_batch_retries", "Provider batch fetch retries");
}

/// Prometheus scrape endpoint, text exposition format.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
