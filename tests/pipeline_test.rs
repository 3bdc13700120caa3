//! Full pipeline runs against the in-process store and a scripted provider.

mod fixtures;

use chrono::{NaiveDate, Utc};
use fixtures::*;
use lead_ingest::{
    db::memory::MemoryStore,
    models::{
        candidate::{Classification, PreviewRequest},
        dnm::{NewDnmEntry, ReasonCategory, SubjectRef},
        job::{CreateJobRequest, CriteriaInput, JobStatus, LogLevel},
        record::ExternalId,
    },
    services::{
        dnm::DnmGuard,
        export::Exporter,
        identifier::IdentifierGenerator,
        provider::{sample_lead, ScriptedProvider},
        scheduler::{Scheduler, SchedulerSettings},
        store::JobStore,
        submission::SubmissionService,
        worker::{BatchWorker, JobOutcome, RetryPolicy, WorkerSettings},
    },
};
use std::sync::Arc;
use std::time::Duration;

struct Pipeline {
    store: Arc<MemoryStore>,
    provider: Arc<ScriptedProvider>,
    dnm: Arc<DnmGuard>,
    submissions: SubmissionService,
    scheduler: Scheduler,
    exporter: Exporter,
}

fn pipeline(batch_size: usize) -> Pipeline {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(ScriptedProvider::new());
    let dnm = Arc::new(DnmGuard::new(store.clone()));

    let worker = BatchWorker::new(
        store.clone(),
        store.clone(),
        dnm.clone(),
        Arc::new(IdentifierGenerator::new(store.clone(), store.clone(), 5)),
        provider.clone(),
        WorkerSettings {
            worker_id: "pipeline-1".to_string(),
            batch_size,
            inter_batch_delay: Duration::ZERO,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        },
    );

    Pipeline {
        submissions: SubmissionService::new(store.clone(), store.clone(), dnm.clone(), 100),
        scheduler: Scheduler::new(
            store.clone(),
            Arc::new(worker),
            SchedulerSettings {
                poll_interval: Duration::from_millis(5),
                stale_timeout: Duration::from_secs(900),
                sweep_interval: Duration::from_secs(60),
            },
        ),
        exporter: Exporter::new(store.clone(), store.clone(), dnm.clone()),
        store,
        provider,
        dnm,
    }
}

fn submit_request(include: &[String], exclude: &[&str]) -> CreateJobRequest {
    CreateJobRequest {
        criteria: CriteriaInput {
            include_ids: Some(include.to_vec()),
            exclude_ids: Some(exclude.iter().map(|id| id.to_string()).collect()),
            source_list_id: None,
        },
        created_by: "pipeline-tests".to_string(),
    }
}

fn dnm_entry(id: &str) -> NewDnmEntry {
    NewDnmEntry {
        subject: SubjectRef::external(ExternalId::new(id)),
        reason: "deceased".to_string(),
        reason_category: ReasonCategory::Deceased,
        source: "obituary-feed".to_string(),
    }
}

#[tokio::test]
async fn test_submit_ingest_export() {
    let p = pipeline(2);
    for fixture in LEAD_FIXTURES {
        let mut lead = sample_lead(fixture.external_id, fixture.state);
        lead.property_type = fixture.property_type.to_string();
        p.provider.add_lead(fixture.external_id, lead);
    }
    for id in REJECTED_IDS {
        p.provider.add_error(id, "record withdrawn by provider");
    }
    p.dnm.add(dnm_entry("FX-1004")).await.unwrap();

    let mut ids = fixture_ids();
    ids.extend(REJECTED_IDS.iter().map(|id| id.to_string()));
    let job = p
        .submissions
        .submit(submit_request(&ids, &["FX-1001"]))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let (job_id, outcome) = p.scheduler.run_once().await.unwrap().unwrap();
    assert_eq!(job_id, job.id);
    assert_eq!(outcome, JobOutcome::Completed);

    let job = p.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.total_records, 6);
    assert_eq!(job.processed_records, 6);
    // FX-1002, FX-1003, FX-1005 persisted; FX-1004 blocked; two rejected.
    assert_eq!(job.success_count, 3);
    assert_eq!(job.error_count, 3);
    assert_eq!(job.batches_completed, 3);
    for fixture in LEAD_FIXTURES {
        let expected = !matches!(fixture.external_id, "FX-1001" | "FX-1004");
        assert_eq!(
            p.store.record_by_external_id(fixture.external_id).is_some(),
            expected,
            "{}: {}",
            fixture.external_id,
            fixture.description
        );
    }

    let houseboat = p.store.record_by_external_id("FX-1005").unwrap();
    assert!(houseboat.identifier.as_str().starts_with("ONY"));
    let condo = p.store.record_by_external_id("FX-1002").unwrap();
    assert!(condo.identifier.as_str().starts_with("CCA"));

    let logs = p.store.job_logs(job.id).await.unwrap();
    assert!(logs.windows(2).all(|w| w[0].log_id < w[1].log_id));
    assert!(logs
        .iter()
        .any(|e| e.level == LogLevel::Warning && e.message.contains("FX-1004")));

    // Blocked after ingestion: withheld from export until overridden.
    p.dnm.add(dnm_entry("FX-1003")).await.unwrap();
    let batch = p.exporter.export(job.id, &[]).await.unwrap();
    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.suppressed, vec![ExternalId::new("FX-1003")]);

    let batch = p
        .exporter
        .export(job.id, &[ExternalId::new("FX-1003")])
        .await
        .unwrap();
    assert_eq!(batch.records.len(), 3);
}

#[tokio::test]
async fn test_overlapping_source_lists_report_same_mailing() {
    let p = pipeline(10);
    let mailed_on = NaiveDate::from_ymd_opt(2026, 6, 15).unwrap();
    let shared = ["S-1", "S-2", "S-3", "S-4", "S-5"];
    for id in shared {
        let record_id = p.store.seed_record(id, "FL");
        p.store.record_mailing(record_id, mailed_on);
    }
    p.store
        .add_source_list("list-a", &["A-1", "S-1", "S-2", "S-3", "S-4", "S-5"]);
    p.store
        .add_source_list("list-b", &["S-5", "S-4", "S-3", "S-2", "S-1", "B-1"]);

    for list in ["list-a", "list-b"] {
        let summary = p
            .submissions
            .preview(PreviewRequest {
                criteria: CriteriaInput {
                    source_list_id: Some(list.to_string()),
                    ..Default::default()
                },
                exclude_all_duplicates: false,
                exclude_mailed_within_days: None,
            })
            .await
            .unwrap();

        assert_eq!(summary.total, 6);
        assert_eq!(summary.duplicate_mailed, 5);
        assert_eq!(summary.new, 1);
        for candidate in summary
            .candidates
            .iter()
            .filter(|c| c.external_id.as_str().starts_with("S-"))
        {
            assert_eq!(candidate.classification, Classification::DuplicateMailed);
            assert_eq!(candidate.last_campaign_date, Some(mailed_on));
        }
    }

    let days_since = (Utc::now().date_naive() - mailed_on).num_days() as u32;
    let summary = p
        .submissions
        .preview(PreviewRequest {
            criteria: CriteriaInput {
                source_list_id: Some("list-a".to_string()),
                ..Default::default()
            },
            exclude_all_duplicates: false,
            exclude_mailed_within_days: Some(days_since + 1),
        })
        .await
        .unwrap();
    assert_eq!(summary.candidates.len(), 1);
}

#[tokio::test]
async fn test_source_list_job_links_existing_records() {
    let p = pipeline(3);
    p.store.seed_record("OLD-1", "OR");
    p.store.add_source_list("spring", &["OLD-1", "NEW-1", "NEW-2"]);
    p.provider.add_leads(&["OLD-1", "NEW-1", "NEW-2"], "OR");

    let job = p
        .submissions
        .submit(CreateJobRequest {
            criteria: CriteriaInput {
                source_list_id: Some("spring".to_string()),
                exclude_ids: Some(vec!["NEW-2".to_string()]),
                ..Default::default()
            },
            created_by: "pipeline-tests".to_string(),
        })
        .await
        .unwrap();

    p.scheduler.run_once().await.unwrap();
    let job = p.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_records, 2);
    assert_eq!(job.success_count, 2);
    assert_eq!(p.store.record_count(), 2);

    let batch = p.exporter.export(job.id, &[]).await.unwrap();
    let mut exported: Vec<&str> = batch.records.iter().map(|r| r.external_id.as_str()).collect();
    exported.sort();
    assert_eq!(exported, vec!["NEW-1", "OLD-1"]);
}

#[tokio::test]
async fn test_cancelled_pending_job_is_never_run() {
    let p = pipeline(5);
    p.provider.add_leads(&["C-1"], "KS");
    let job = p
        .submissions
        .submit(submit_request(&["C-1".to_string()], &[]))
        .await
        .unwrap();

    let cancelled = p.store.cancel(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(p.scheduler.run_once().await.unwrap(), None);
    assert!(p.provider.calls().is_empty());
    assert!(p.store.complete(job.id, "w-1").await.is_err());
}
