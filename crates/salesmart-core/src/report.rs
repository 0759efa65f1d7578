use tracing::{error, info};

use crate::api::{ReportApi, GENERATE_REPORT, GET_INCREMENT};
use crate::error::{PipelineError, Result};
use crate::types::{BusinessDate, IncrementHandle, JobHandle, ReportHandle};

/// Starts a report job. Every call creates a new job on the service.
pub async fn generate_report(api: &dyn ReportApi) -> Result<JobHandle> {
    info!("requesting report generation");
    let response = api.generate_report().await?;

    let task_id = response
        .task_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| {
            error!("generate_report response carried no task_id");
            PipelineError::upstream(GENERATE_REPORT, "response has no task_id")
        })?;

    info!(task_id = %task_id, "report generation started");
    Ok(JobHandle::new(task_id))
}

/// Looks up the increment of `report` covering `date`.
///
/// A missing or empty increment id is an error: a scheduled run always
/// expects data for its date.
pub async fn resolve_increment(
    api: &dyn ReportApi,
    report: &ReportHandle,
    date: BusinessDate,
) -> Result<IncrementHandle> {
    info!(report_id = %report, date = %date, "resolving increment");
    let response = api.get_increment(report, date).await?;

    let increment_id = response
        .data
        .and_then(|data| data.increment_id)
        .filter(|id| !id.trim().is_empty());

    match increment_id {
        Some(id) => {
            info!(report_id = %report, increment_id = %id, "increment resolved");
            Ok(IncrementHandle::new(id))
        }
        None => {
            error!(
                report_id = %report,
                date = %date,
                endpoint = GET_INCREMENT,
                "increment is empty, most probably due to an upstream error"
            );
            Err(PipelineError::EmptyIncrement {
                report_id: report.to_string(),
                date: date.iso(),
            })
        }
    }
}
