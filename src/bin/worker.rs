use lead_ingest::{
    config::AppConfig,
    db::{self, PgStore},
    routes::metrics::describe_metrics,
    services::{
        dnm::DnmGuard,
        identifier::IdentifierGenerator,
        provider::LeadProviderClient,
        scheduler::Scheduler,
        sequence::RedisSequence,
        worker::BatchWorker,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting lead ingestion worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: std::net::SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to start Prometheus metrics listener");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let store = Arc::new(PgStore::new(db_pool));

    tracing::info!("Initializing services");
    let sequence = Arc::new(
        RedisSequence::new(&config.redis_url).expect("Failed to initialize Redis client"),
    );
    let provider = Arc::new(
        LeadProviderClient::new(
            &config.provider_base_url,
            &config.provider_api_key,
            config.provider_timeout(),
        )
        .expect("Failed to initialize lead provider client"),
    );

    let settings = config.worker_settings();
    let worker_id = settings.worker_id.clone();
    let worker = BatchWorker::new(
        store.clone(),
        store.clone(),
        Arc::new(DnmGuard::new(store.clone())),
        Arc::new(IdentifierGenerator::new(
            store.clone(),
            sequence,
            config.id_max_attempts,
        )),
        provider,
        settings,
    );
    let scheduler = Scheduler::new(store, Arc::new(worker), config.scheduler_settings());

    tracing::info!(worker_id = %worker_id, "Worker ready, starting job processing loop");

    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    tracing::info!(worker_id = %worker_id, "Worker stopped");
}
