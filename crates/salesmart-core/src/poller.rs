//! Bounded polling of report job status.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::api::{ReportApi, GET_REPORT};
use crate::error::{PipelineError, Result};
use crate::types::{JobHandle, ReportHandle};

/// Fixed attempt budget with a constant delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl PollPolicy {
    /// Upper bound on time spent sleeping between polls.
    pub fn budget(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            delay: Duration::from_secs(10),
        }
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Polls job status until it reports `SUCCESS` or the budget runs out.
///
/// A failed status request aborts polling immediately; it does not count as
/// an attempt.
pub async fn poll_report(
    api: &dyn ReportApi,
    job: &JobHandle,
    policy: PollPolicy,
    sleeper: &dyn Sleeper,
) -> Result<ReportHandle> {
    for attempt in 1..=policy.max_attempts {
        let response = api.get_report(job).await?;
        debug!(task_id = %job, attempt, status = %response.status, "polled report status");

        if response.is_success() {
            let report_id = response
                .data
                .and_then(|data| data.report_id)
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| {
                    PipelineError::upstream(GET_REPORT, "SUCCESS status without report_id")
                })?;
            info!(task_id = %job, report_id = %report_id, attempt, "report ready");
            return Ok(ReportHandle::new(report_id));
        }

        if attempt < policy.max_attempts {
            sleeper.sleep(policy.delay).await;
        }
    }

    error!(
        task_id = %job,
        attempts = policy.max_attempts,
        "timed out waiting for report"
    );
    Err(PipelineError::PollTimeout {
        task_id: job.to_string(),
        attempts: policy.max_attempts,
    })
}
