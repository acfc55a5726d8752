//! Job table and bounded history
//!
//! All job state lives here behind one lock held by [`super::JobQueue`].
//! Readers always get clones, so nothing outside the worker ever holds a
//! reference into a job while it is processing.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

use super::stats::StatsAccumulator;
use crate::error::{GramcastError, PublishError};
use crate::publisher::PublishOutcome;
use crate::types::{Job, JobError, JobId, JobResult, JobSpec, JobStatus, QueueStats};

#[derive(Debug)]
pub(crate) struct JobTable {
    jobs: HashMap<JobId, Job>,
    /// Terminal jobs, most recently updated first
    history: VecDeque<Job>,
    max_history: usize,
    stats: StatsAccumulator,
}

impl JobTable {
    pub(crate) fn new(max_history: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            history: VecDeque::new(),
            max_history,
            stats: StatsAccumulator::default(),
        }
    }

    pub(crate) fn insert(&mut self, job: Job) {
        self.stats.record_submitted(job.content_type());
        self.jobs.insert(job.id.clone(), job);
    }

    /// Undo an insert whose enqueue failed
    pub(crate) fn remove(&mut self, job_id: &str) -> Option<Job> {
        self.history.retain(|j| j.id != job_id);
        self.jobs.remove(job_id)
    }

    pub(crate) fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id).cloned()
    }

    /// Move a pending job to processing and hand out its spec
    pub(crate) fn begin(&mut self, job_id: &str) -> Option<JobSpec> {
        let job = self.jobs.get_mut(job_id)?;
        if !job.status.can_transition_to(JobStatus::Processing) {
            debug!(job_id, status = %job.status, "Dequeued job is not pending, skipping");
            return None;
        }
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.updated_at = Utc::now();
        Some(job.spec.clone())
    }

    /// Record the outcome of processing and return the updated job
    pub(crate) fn finish(
        &mut self,
        job_id: &str,
        outcome: &Result<PublishOutcome, PublishError>,
        elapsed: Duration,
    ) -> Option<Job> {
        let job = self.jobs.get_mut(job_id)?;
        let next = match outcome {
            Ok(_) => JobStatus::Completed,
            Err(e) => e.job_status(),
        };
        if !job.status.can_transition_to(next) {
            warn!(job_id, from = %job.status, to = %next, "Refusing invalid status transition");
            return None;
        }

        job.status = next;
        job.updated_at = Utc::now();
        match outcome {
            Ok(published) => {
                job.result = Some(JobResult {
                    id: published.post_id.clone(),
                    permalink: published.permalink.clone(),
                    container_id: published.container_id.clone(),
                    reconciled: published.reconciled,
                });
                job.error = None;
            }
            Err(e) => {
                job.result = None;
                job.error = Some(JobError::from(e));
            }
        }

        let snapshot = job.clone();
        self.stats.record_outcome(next, elapsed);
        self.push_history(snapshot.clone());
        Some(snapshot)
    }

    fn push_history(&mut self, job: Job) {
        self.history.retain(|j| j.id != job.id);
        self.history.push_front(job);
        while self.history.len() > self.max_history {
            if let Some(evicted) = self.history.pop_back() {
                debug!(job_id = %evicted.id, "Evicted job from history");
            }
        }
    }

    /// Put a resettable job back to pending
    pub(crate) fn reset(&mut self, job_id: &str) -> crate::Result<Job> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| GramcastError::NotFound(format!("job {}", job_id)))?;

        if !job.status.can_transition_to(JobStatus::Pending) {
            return Err(GramcastError::InvalidInput(format!(
                "job {} is {} and cannot be reset",
                job_id, job.status
            )));
        }

        job.status = JobStatus::Pending;
        job.result = None;
        job.error = None;
        job.updated_at = Utc::now();
        let snapshot = job.clone();
        self.history.retain(|j| j.id != job_id);
        Ok(snapshot)
    }

    pub(crate) fn history(&self, limit: usize) -> Vec<Job> {
        self.history.iter().take(limit).cloned().collect()
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let count = |status: JobStatus| self.jobs.values().filter(|j| j.status == status).count() as u64;
        self.stats
            .snapshot(count(JobStatus::Pending), count(JobStatus::Processing))
    }

    /// Drop terminal jobs not updated within `retention` of `now`
    ///
    /// Returns the removed jobs so the caller can release whatever they
    /// still hold on disk.
    pub(crate) fn prune(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<Job> {
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = now - retention;
        let expired = |job: &Job| job.status.is_terminal() && job.updated_at < cutoff;

        let expired_ids: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| expired(job))
            .map(|job| job.id.clone())
            .collect();
        self.history.retain(|job| !expired(job));
        expired_ids.iter().filter_map(|id| self.jobs.remove(id)).collect()
    }

    #[cfg(test)]
    pub(crate) fn get_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiErrorDetail;
    use crate::types::{MediaRef, SubmitOptions};

    fn job() -> Job {
        Job::new(
            JobSpec::build(
                vec![MediaRef::new("https://cdn.example.com/a.jpg")],
                String::new(),
                &SubmitOptions::default(),
            )
            .unwrap(),
        )
    }

    fn published(post_id: &str) -> Result<PublishOutcome, PublishError> {
        Ok(PublishOutcome {
            post_id: post_id.to_string(),
            permalink: None,
            container_id: "C1".to_string(),
            reconciled: false,
        })
    }

    fn run(table: &mut JobTable, outcome: Result<PublishOutcome, PublishError>) -> JobId {
        let job = job();
        let id = job.id.clone();
        table.insert(job);
        table.begin(&id).unwrap();
        table.finish(&id, &outcome, Duration::from_secs(1)).unwrap();
        id
    }

    #[test]
    fn test_lifecycle_and_history_order() {
        let mut table = JobTable::new(10);
        let first = run(&mut table, published("P1"));
        let second = run(
            &mut table,
            Err(PublishError::Media(ApiErrorDetail::new("bad image"))),
        );

        let history = table.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second);
        assert_eq!(history[1].id, first);
        assert_eq!(history[0].status, JobStatus::Failed);
        assert_eq!(history[1].result.as_ref().unwrap().id, "P1");
    }

    #[test]
    fn test_history_is_bounded() {
        let mut table = JobTable::new(3);
        let ids: Vec<_> = (0..5).map(|i| run(&mut table, published(&format!("P{}", i)))).collect();

        let history = table.history(100);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, ids[4]);
        assert_eq!(history[2].id, ids[2]);
    }

    #[test]
    fn test_begin_requires_pending() {
        let mut table = JobTable::new(10);
        let id = run(&mut table, published("P1"));
        assert!(table.begin(&id).is_none());
        assert!(table.begin("unknown").is_none());
    }

    #[test]
    fn test_reset_only_from_resettable_status() {
        let mut table = JobTable::new(10);
        let completed = run(&mut table, published("P1"));
        assert!(matches!(
            table.reset(&completed),
            Err(GramcastError::InvalidInput(_))
        ));

        let limited = run(
            &mut table,
            Err(PublishError::RateLimit {
                detail: ApiErrorDetail::new("slow down"),
                retry_after: Duration::from_secs(900),
            }),
        );
        let job = table.reset(&limited).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());
        assert!(table.history(10).iter().all(|j| j.id != limited));

        assert!(matches!(table.reset("nope"), Err(GramcastError::NotFound(_))));
    }

    #[test]
    fn test_history_keeps_every_resettable_failure() {
        let mut table = JobTable::new(10);
        let limited = run(
            &mut table,
            Err(PublishError::RateLimit {
                detail: ApiErrorDetail::new("slow down"),
                retry_after: Duration::from_secs(60),
            }),
        );
        let blocked = run(
            &mut table,
            Err(PublishError::PolicyViolation(ApiErrorDetail::new("blocked term"))),
        );

        let history = table.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, blocked);
        assert_eq!(history[0].status, JobStatus::PolicyViolation);
        assert_eq!(history[1].id, limited);
        assert_eq!(history[1].status, JobStatus::RateLimited);

        // Gone from history once an operator puts it back in line
        table.reset(&limited).unwrap();
        assert_eq!(table.history(10).len(), 1);
    }

    #[test]
    fn test_prune_drops_only_old_terminal_jobs() {
        let mut table = JobTable::new(10);
        let old = run(&mut table, published("P1"));
        let fresh = run(&mut table, published("P2"));
        let waiting = job();
        let waiting_id = waiting.id.clone();
        table.insert(waiting);

        let two_days_ago = Utc::now() - chrono::Duration::hours(48);
        table.get_mut(&old).unwrap().updated_at = two_days_ago;
        table.get_mut(&waiting_id).unwrap().updated_at = two_days_ago;
        // history holds its own snapshot; age it too
        table.history.iter_mut().for_each(|j| {
            if j.id == old {
                j.updated_at = two_days_ago;
            }
        });

        let removed = table.prune(Utc::now(), Duration::from_secs(24 * 3600));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, old);
        assert!(table.get(&old).is_none());
        assert!(table.get(&fresh).is_some());
        assert!(table.get(&waiting_id).is_some());
        assert_eq!(table.history(10).len(), 1);
    }

    #[test]
    fn test_stats_counts_live_statuses() {
        let mut table = JobTable::new(10);
        run(&mut table, published("P1"));
        let pending = job();
        table.insert(pending);

        let stats = table.stats();
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.pending_jobs, 1);
        assert_eq!(stats.completed_jobs, 1);
        assert_eq!(stats.processing_jobs, 0);
    }
}
