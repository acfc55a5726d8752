//! Reconciliation after ambiguous publish failures
//!
//! The remote API has been seen to publish a container and still answer
//! the publish call with HTTP 400 or 403. Republishing in that case creates
//! a duplicate post. Before a job is marked failed, the verifier looks at
//! the account's most recent posts and scores each one against the recorded
//! publish attempt.
//!
//! Scoring is a heuristic with configurable thresholds:
//!
//! | evidence                                   | confidence |
//! |--------------------------------------------|------------|
//! | container id echoed in the post's caption  | 1.0        |
//! | posted within the high-confidence window   | 0.7 + 0.2  |
//! | posted within the medium-confidence window | 0.5 + 0.2  |
//! | posted within the match window             | 0.3 + 0.2  |
//! | anything older                             | 0.0        |
//!
//! The `+ 0.2` is granted when the post carries a parseable timestamp. Every
//! decision is logged with its score.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::client::{PublishClient, RemotePost};
use crate::config::VerifierConfig;
use crate::error::PublishError;

const HIGH_CONFIDENCE: f64 = 0.7;
const MEDIUM_CONFIDENCE: f64 = 0.5;
const LOW_CONFIDENCE: f64 = 0.3;
const TIMESTAMP_BONUS: f64 = 0.2;

/// A recent post judged to be the result of a failed-looking publish
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedPost {
    pub post_id: String,
    pub permalink: Option<String>,
    pub confidence: f64,
}

pub struct PublicationVerifier {
    client: Arc<PublishClient>,
    config: VerifierConfig,
    attempts: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Post ids already attributed to some job; never matched twice
    claimed: Mutex<HashSet<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Parse the remote timestamp format (`2024-05-01T12:00:00+0000`) or RFC 3339
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl PublicationVerifier {
    pub fn new(client: Arc<PublishClient>, config: VerifierConfig) -> Self {
        Self {
            client,
            config,
            attempts: Mutex::new(HashMap::new()),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Record that a publish of `container_id` is about to be attempted
    ///
    /// Attempts older than the retention window are dropped.
    pub fn record_attempt(&self, container_id: &str) {
        self.record_attempt_at(container_id, Utc::now());
    }

    pub fn record_attempt_at(&self, container_id: &str, at: DateTime<Utc>) {
        let mut attempts = lock(&self.attempts);
        attempts.insert(container_id.to_string(), at);

        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let cutoff = at - retention;
        let before = attempts.len();
        attempts.retain(|_, recorded| *recorded >= cutoff);
        let pruned = before - attempts.len();
        if pruned > 0 {
            debug!(pruned, "Dropped expired publish attempts");
        }
    }

    pub fn attempt_time(&self, container_id: &str) -> Option<DateTime<Utc>> {
        lock(&self.attempts).get(container_id).copied()
    }

    /// Longest a full `check_after_error` can take
    pub fn worst_case(&self) -> std::time::Duration {
        let passes = self.config.check_attempts.max(1);
        self.client.retry_policy().worst_case().saturating_mul(passes)
            + self.config.check_interval.saturating_mul(passes - 1)
    }

    /// Mark a post id as belonging to a job so it is never matched again
    pub fn note_published(&self, post_id: &str) {
        lock(&self.claimed).insert(post_id.to_string());
    }

    /// Score how likely `post` is the publication of `container_id`
    pub fn confidence(&self, post: &RemotePost, container_id: &str, attempted_at: DateTime<Utc>) -> f64 {
        if post
            .caption
            .as_deref()
            .map(|c| c.contains(container_id))
            .unwrap_or(false)
        {
            return 1.0;
        }

        let Some(posted_at) = post.timestamp.as_deref().and_then(parse_timestamp) else {
            return 0.0;
        };

        let delta = posted_at - attempted_at;
        let distance = (if delta < chrono::Duration::zero() { -delta } else { delta })
            .to_std()
            .unwrap_or_default();
        let base = if distance <= self.config.high_confidence_window {
            HIGH_CONFIDENCE
        } else if distance <= self.config.medium_confidence_window {
            MEDIUM_CONFIDENCE
        } else if distance <= self.config.match_window {
            LOW_CONFIDENCE
        } else {
            return 0.0;
        };

        (base + TIMESTAMP_BONUS).min(1.0)
    }

    /// Pick the best-scoring unclaimed post at or above the threshold
    pub fn best_match(&self, posts: &[RemotePost], container_id: &str, attempted_at: DateTime<Utc>) -> Option<VerifiedPost> {
        let claimed = lock(&self.claimed);
        let mut best: Option<VerifiedPost> = None;

        for post in posts.iter().filter(|p| !claimed.contains(&p.id)) {
            let confidence = self.confidence(post, container_id, attempted_at);
            debug!(container_id, post_id = %post.id, confidence, "Scored recent post");
            if confidence >= self.config.threshold
                && best.as_ref().map(|b| confidence > b.confidence).unwrap_or(true)
            {
                best = Some(VerifiedPost {
                    post_id: post.id.clone(),
                    permalink: post.permalink.clone(),
                    confidence,
                });
            }
        }

        best
    }

    /// Look for evidence that `container_id` was published despite an error
    ///
    /// Makes up to `check_attempts` passes over the recent posts,
    /// `check_interval` apart. A failure to list posts counts as no match
    /// for that pass.
    ///
    /// # Errors
    ///
    /// Only [`PublishError::Cancelled`], when shutdown interrupts the wait
    /// between passes.
    pub async fn check_after_error(&self, container_id: &str) -> Result<Option<VerifiedPost>, PublishError> {
        let attempted_at = self.attempt_time(container_id).unwrap_or_else(Utc::now);
        let passes = self.config.check_attempts.max(1);

        for pass in 1..=passes {
            match self.client.recent_media(self.config.recent_limit).await {
                Ok(posts) => {
                    if let Some(found) = self.best_match(&posts, container_id, attempted_at) {
                        info!(
                            container_id,
                            post_id = %found.post_id,
                            confidence = found.confidence,
                            threshold = self.config.threshold,
                            "Publish reported failure but a matching post exists; treating as published"
                        );
                        self.note_published(&found.post_id);
                        return Ok(Some(found));
                    }
                    debug!(container_id, pass, candidates = posts.len(), "No matching post yet");
                }
                Err(PublishError::Cancelled) => return Err(PublishError::Cancelled),
                Err(e) => {
                    warn!(container_id, pass, "Could not list recent posts for verification: {}", e);
                }
            }

            if pass < passes {
                self.client.sleep(self.config.check_interval).await?;
            }
        }

        warn!(
            container_id,
            passes,
            threshold = self.config.threshold,
            "No recent post matched the failed publish; keeping the failure"
        );
        Ok(None)
    }
}
