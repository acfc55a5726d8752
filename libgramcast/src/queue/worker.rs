//! The single background worker
//!
//! Pulls job ids off the channel in FIFO order and drives each one to a
//! terminal status before taking the next. Nothing else ever moves a job
//! out of `processing`.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{Event, EventBus};
use super::{lock, JobTable};
use crate::error::{ApiErrorDetail, PublishError};
use crate::media::MediaResolver;
use crate::publisher::JobProcessor;
use crate::types::{JobId, JobSpec, JobStatus};

/// First blocked term found in the caption, compared case-insensitively
pub fn find_blocked_term<'a>(caption: &str, blocked_terms: &'a [String]) -> Option<&'a str> {
    let caption = caption.to_lowercase();
    blocked_terms
        .iter()
        .map(String::as_str)
        .filter(|term| !term.trim().is_empty())
        .find(|term| caption.contains(&term.to_lowercase()))
}

pub(crate) struct Worker {
    pub(crate) table: Arc<Mutex<JobTable>>,
    pub(crate) events: EventBus,
    pub(crate) processor: Arc<dyn JobProcessor>,
    pub(crate) resolver: MediaResolver,
    pub(crate) blocked_terms: Vec<String>,
    pub(crate) retention: Duration,
    pub(crate) shutdown: CancellationToken,
    pub(crate) receiver: mpsc::UnboundedReceiver<JobId>,
}

impl Worker {
    pub(crate) async fn run(mut self) {
        info!("Queue worker started");
        while let Some(job_id) = self.receiver.recv().await {
            self.process_one(&job_id).await;
        }
        info!("Queue worker stopped");
    }

    async fn process_one(&self, job_id: &str) {
        let Some(spec) = lock(&self.table).begin(job_id) else {
            return;
        };

        let content_type = spec.content_type();
        let worst_case = self.processor.worst_case_duration(&spec);
        info!(
            job_id,
            content_type = %content_type,
            worst_case_secs = worst_case.as_secs(),
            "Processing job"
        );
        self.events.emit(Event::JobStarted {
            job_id: job_id.to_string(),
            content_type,
            worst_case_secs: worst_case.as_secs(),
        });

        let started = Instant::now();
        let outcome = self.execute(job_id, &spec).await;
        let elapsed = started.elapsed();

        if elapsed > worst_case {
            warn!(
                job_id,
                elapsed_secs = elapsed.as_secs(),
                worst_case_secs = worst_case.as_secs(),
                "Job ran past its worst-case duration"
            );
        }

        let finished = lock(&self.table).finish(job_id, &outcome, elapsed);
        let final_status = finished.as_ref().map(|job| job.status);
        match (finished, &outcome) {
            (Some(job), Ok(_)) => {
                if let Some(result) = job.result {
                    info!(job_id, post_id = %result.id, reconciled = result.reconciled, "Job completed");
                    self.events.emit(Event::JobCompleted {
                        job_id: job_id.to_string(),
                        result,
                        duration_secs: elapsed.as_secs_f64(),
                    });
                }
            }
            (Some(job), Err(e)) => {
                match job.status {
                    JobStatus::RateLimited => warn!(
                        job_id,
                        retry_after_secs = e.retry_after().map(|d| d.as_secs()),
                        "Job rate limited: {}",
                        e
                    ),
                    _ => error!(job_id, status = %job.status, kind = e.kind(), "Job failed: {}", e),
                }
                if let Some(error) = job.error {
                    self.events.emit(Event::JobFailed {
                        job_id: job_id.to_string(),
                        status: job.status,
                        error,
                    });
                }
            }
            (None, _) => warn!(job_id, "Job disappeared while processing"),
        }

        // A resettable job may run again, so its media stays until it
        // completes or expires
        match final_status {
            Some(JobStatus::Completed) => self.release_media(job_id, &spec).await,
            Some(status) if status.is_resettable() => {
                debug!(job_id, status = %status, "Keeping job media until reset or expiry")
            }
            _ => {}
        }

        let pruned = lock(&self.table).prune(Utc::now(), self.retention);
        if pruned.is_empty() {
            return;
        }
        info!(pruned = pruned.len(), "Pruned expired jobs");
        for job in pruned.iter().filter(|job| job.status != JobStatus::Completed) {
            self.release_media(&job.id, &job.spec).await;
        }
    }

    async fn release_media(&self, job_id: &str, spec: &JobSpec) {
        let removed = self.resolver.cleanup(spec).await;
        if removed > 0 {
            debug!(job_id, removed, "Cleaned up job media");
        }
    }

    async fn execute(&self, job_id: &str, spec: &JobSpec) -> Result<crate::publisher::PublishOutcome, PublishError> {
        if self.shutdown.is_cancelled() {
            return Err(PublishError::Cancelled);
        }

        if let Some(term) = find_blocked_term(spec.caption(), &self.blocked_terms) {
            warn!(job_id, term, "Caption blocked by content policy");
            return Err(PublishError::PolicyViolation(ApiErrorDetail::new(format!(
                "caption contains blocked term '{}'",
                term
            ))));
        }

        self.processor.process(spec).await
    }
}
