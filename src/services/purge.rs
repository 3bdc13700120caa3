use crate::error::IngestError;
use crate::models::record::{PurgeReport, StateCode};
use crate::services::store::RecordStore;

/// Count, and with `confirm` delete, every stored record in one state.
/// Registered identifiers and do-not-mail entries are left in place.
pub async fn purge_state(
    records: &dyn RecordStore,
    state: &str,
    confirm: bool,
) -> Result<PurgeReport, IngestError> {
    let state = StateCode::parse(state).map_err(IngestError::Validation)?;
    let report = records.purge_state(&state, confirm).await?;

    if report.deleted {
        tracing::warn!(
            state = %report.state,
            records = report.records,
            mail_recipients = report.mail_recipients,
            job_links = report.job_links,
            "Purged records for state"
        );
    } else {
        tracing::info!(
            state = %report.state,
            records = report.records,
            "Dry-run state purge"
        );
    }
    Ok(report)
}
