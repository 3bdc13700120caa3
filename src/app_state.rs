use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db::PgStore;
use crate::services::{
    dnm::DnmGuard,
    export::Exporter,
    sequence::RedisSequence,
    store::{JobStore, RecordStore},
    submission::SubmissionService,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PgStore>,
    pub sequence: Arc<RedisSequence>,
    pub jobs: Arc<dyn JobStore>,
    pub records: Arc<dyn RecordStore>,
    pub dnm: Arc<DnmGuard>,
    pub submissions: Arc<SubmissionService>,
    pub exporter: Arc<Exporter>,
    pub stale_timeout: Duration,
}

impl AppState {
    pub fn new(store: PgStore, sequence: RedisSequence, config: &AppConfig) -> Self {
        let store = Arc::new(store);
        let jobs: Arc<dyn JobStore> = store.clone();
        let records: Arc<dyn RecordStore> = store.clone();
        let dnm = Arc::new(DnmGuard::new(store.clone()));

        Self {
            submissions: Arc::new(SubmissionService::new(
                jobs.clone(),
                records.clone(),
                dnm.clone(),
                config.lookup_chunk_size,
            )),
            exporter: Arc::new(Exporter::new(jobs.clone(), records.clone(), dnm.clone())),
            sequence: Arc::new(sequence),
            stale_timeout: config.stale_timeout(),
            store,
            jobs,
            records,
            dnm,
        }
    }
}
