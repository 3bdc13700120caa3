use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use lead_ingest::{
    app_state::AppState,
    config::AppConfig,
    db::{self, PgStore},
    routes,
    services::sequence::RedisSequence,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing lead-ingest API server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Connecting to Redis");
    let sequence = RedisSequence::new(&config.redis_url).expect("Failed to initialize Redis client");

    let state = AppState::new(PgStore::new(db_pool), sequence, &config);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/jobs",
            post(routes::jobs::create_job).get(routes::jobs::list_jobs),
        )
        .route("/api/v1/jobs/stale", get(routes::jobs::list_stale_jobs))
        .route("/api/v1/jobs/{job_id}", get(routes::jobs::get_job))
        .route("/api/v1/jobs/{job_id}/logs", get(routes::jobs::get_job_logs))
        .route("/api/v1/jobs/{job_id}/cancel", post(routes::jobs::cancel_job))
        .route("/api/v1/jobs/{job_id}/reset", post(routes::jobs::reset_job))
        .route("/api/v1/jobs/{job_id}/export", post(routes::jobs::export_job))
        .route(
            "/api/v1/candidates/preview",
            post(routes::candidates::preview_candidates),
        )
        .route("/api/v1/dnm", post(routes::dnm::add_entry))
        .route("/api/v1/dnm/check", post(routes::dnm::check))
        .route(
            "/api/v1/dnm/{entry_id}/deactivate",
            post(routes::dnm::deactivate_entry),
        )
        .route("/api/v1/admin/purge-state", post(routes::admin::purge_state))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        // Include lists can run to hundreds of thousands of ids
        .layer(RequestBodyLimitLayer::new(32 * 1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
