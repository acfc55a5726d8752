//! Running queue counters

use std::collections::HashMap;
use std::time::Duration;

use crate::types::{ContentType, JobStatus, QueueStats};

/// Cumulative counters, written by the worker under the table lock
///
/// Outcome counters count processing runs, so a job that was reset and
/// processed again contributes twice.
#[derive(Debug, Default)]
pub(crate) struct StatsAccumulator {
    total_jobs: u64,
    completed_jobs: u64,
    failed_jobs: u64,
    rate_limited_jobs: u64,
    policy_violations: u64,
    by_content_type: HashMap<ContentType, u64>,
    processed: u64,
    average_processing_secs: f64,
}

impl StatsAccumulator {
    pub(crate) fn record_submitted(&mut self, content_type: ContentType) {
        self.total_jobs += 1;
        *self.by_content_type.entry(content_type).or_insert(0) += 1;
    }

    pub(crate) fn record_outcome(&mut self, status: JobStatus, elapsed: Duration) {
        match status {
            JobStatus::Completed => self.completed_jobs += 1,
            JobStatus::Failed => self.failed_jobs += 1,
            JobStatus::RateLimited => self.rate_limited_jobs += 1,
            JobStatus::PolicyViolation => self.policy_violations += 1,
            JobStatus::Pending | JobStatus::Processing => return,
        }

        self.processed += 1;
        let secs = elapsed.as_secs_f64();
        self.average_processing_secs += (secs - self.average_processing_secs) / self.processed as f64;
    }

    /// Snapshot with the live pending/processing counts filled in
    pub(crate) fn snapshot(&self, pending_jobs: u64, processing_jobs: u64) -> QueueStats {
        QueueStats {
            total_jobs: self.total_jobs,
            pending_jobs,
            processing_jobs,
            completed_jobs: self.completed_jobs,
            failed_jobs: self.failed_jobs,
            rate_limited_jobs: self.rate_limited_jobs,
            policy_violations: self.policy_violations,
            by_content_type: self.by_content_type.clone(),
            average_processing_secs: self.average_processing_secs,
        }
    }
}
