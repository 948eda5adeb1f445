//! Polls an OCR job until it reaches a terminal status.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::PipelineError;
use crate::ocr::{JobStatus, OcrDocument, OcrJobHandle, OcrService};

/// Wait schedule for one job: capped exponential backoff inside a total budget.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_factor: f64,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_factor).min(self.max_interval)
    }
}

/// Terminal state of a job.
///
/// A job that ends in anything other than `Succeeded` carries an empty
/// document; the status says why.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub status: JobStatus,
    pub document: OcrDocument,
}

pub struct JobPoller {
    service: Arc<dyn OcrService>,
    policy: PollPolicy,
}

impl JobPoller {
    pub fn new(service: Arc<dyn OcrService>, policy: PollPolicy) -> Self {
        Self { service, policy }
    }

    pub async fn await_result(
        &self,
        handle: &OcrJobHandle,
        cancel: &CancelToken,
    ) -> Result<ReadOutcome, PipelineError> {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let mut interval = self.policy.initial_interval;
        let mut attempts = 0u32;
        let mut last_status = JobStatus::NotStarted;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            attempts += 1;
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                r = tokio::time::timeout_at(deadline, self.service.fetch(handle)) => r,
            };
            let Ok(fetched) = fetched else {
                return Err(self.timed_out(handle, started, &last_status));
            };
            let result = fetched.map_err(|e| PipelineError::unavailable("OCR service", e))?;

            if !result.status.is_pending() {
                return Ok(self.finish(handle, result.status, result.document, attempts));
            }
            last_status = result.status;

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(handle, started, &last_status));
            }

            // The last wait is shortened so the final check lands on the deadline.
            let wait = interval.min(deadline - now);
            debug!(
                "Operation {} is {} (attempt {}), waiting {:?}",
                handle, last_status, attempts, wait
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }

            interval = self.policy.next_interval(interval);
        }
    }

    fn timed_out(
        &self,
        handle: &OcrJobHandle,
        started: Instant,
        last_status: &JobStatus,
    ) -> PipelineError {
        PipelineError::PollTimeout {
            operation_id: handle.operation_id().to_string(),
            waited: started.elapsed(),
            last_status: last_status.to_string(),
        }
    }

    fn finish(
        &self,
        handle: &OcrJobHandle,
        status: JobStatus,
        document: Option<OcrDocument>,
        attempts: u32,
    ) -> ReadOutcome {
        match status {
            JobStatus::Succeeded => {
                info!(
                    "Operation {} succeeded after {} status checks",
                    handle, attempts
                );
                ReadOutcome {
                    status,
                    document: document.unwrap_or_default(),
                }
            }
            other => {
                warn!(
                    "Operation {} ended with status {}, treating as no text recognized",
                    handle, other
                );
                ReadOutcome {
                    status: other,
                    document: OcrDocument::empty(),
                }
            }
        }
    }
}
