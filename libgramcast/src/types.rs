//! Core data types for Gramcast

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{GramcastError, PublishError};

/// Opaque job identifier (UUID v4 string)
pub type JobId = String;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "avi", "webm"];

/// Kind of post a job publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Image,
    Carousel,
    Reel,
}

impl ContentType {
    /// Infer the content type from the media references
    ///
    /// More than one reference is a carousel; a single reference with a video
    /// extension is a reel; anything else is an image.
    pub fn infer(media: &[MediaRef]) -> Self {
        if media.len() > 1 {
            ContentType::Carousel
        } else if media.first().map(MediaRef::is_video).unwrap_or(false) {
            ContentType::Reel
        } else {
            ContentType::Image
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentType::Image => write!(f, "image"),
            ContentType::Carousel => write!(f, "carousel"),
            ContentType::Reel => write!(f, "reel"),
        }
    }
}

impl FromStr for ContentType {
    type Err = GramcastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" => Ok(ContentType::Image),
            "carousel" => Ok(ContentType::Carousel),
            "reel" | "video" => Ok(ContentType::Reel),
            other => Err(GramcastError::InvalidInput(format!(
                "Unknown content type '{}'. Valid options: image, carousel, reel",
                other
            ))),
        }
    }
}

/// A media location: either a reachable URL or a local file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(pub String);

impl MediaRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_remote(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }

    /// Local filesystem path, with `~` expanded; `None` for URLs
    pub fn local_path(&self) -> Option<PathBuf> {
        if self.is_remote() {
            return None;
        }
        let location = self.0.strip_prefix("file://").unwrap_or(&self.0);
        Some(PathBuf::from(shellexpand::tilde(location).to_string()))
    }

    pub fn is_video(&self) -> bool {
        let path_part = self.0.split(['?', '#']).next().unwrap_or(&self.0);
        Path::new(path_part)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fields shared by every job kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobBase {
    pub caption: String,
    /// The job owns its local media files and they are removed after processing
    #[serde(default)]
    pub owns_media: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageJob {
    #[serde(flatten)]
    pub base: JobBase,
    pub media: MediaRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarouselJob {
    #[serde(flatten)]
    pub base: JobBase,
    pub items: Vec<MediaRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReelJob {
    #[serde(flatten)]
    pub base: JobBase,
    pub video: MediaRef,
    pub share_to_feed: bool,
}

/// What a job publishes, one variant per content type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "content_type", rename_all = "snake_case")]
pub enum JobSpec {
    Image(ImageJob),
    Carousel(CarouselJob),
    Reel(ReelJob),
}

impl JobSpec {
    /// Build a job spec from raw submission input
    pub fn build(media: Vec<MediaRef>, caption: String, options: &SubmitOptions) -> crate::Result<Self> {
        if media.is_empty() {
            return Err(GramcastError::InvalidInput(
                "At least one media reference is required".to_string(),
            ));
        }

        let content_type = options
            .content_type
            .unwrap_or_else(|| ContentType::infer(&media));
        let base = JobBase {
            caption,
            owns_media: options.owns_media,
        };

        match content_type {
            ContentType::Carousel => Ok(JobSpec::Carousel(CarouselJob { base, items: media })),
            ContentType::Image | ContentType::Reel if media.len() > 1 => {
                Err(GramcastError::InvalidInput(format!(
                    "A {} job takes exactly one media reference, got {}",
                    content_type,
                    media.len()
                )))
            }
            ContentType::Image => Ok(JobSpec::Image(ImageJob {
                base,
                media: media.into_iter().next().ok_or_else(|| {
                    GramcastError::InvalidInput("Missing media reference".to_string())
                })?,
            })),
            ContentType::Reel => Ok(JobSpec::Reel(ReelJob {
                base,
                video: media.into_iter().next().ok_or_else(|| {
                    GramcastError::InvalidInput("Missing media reference".to_string())
                })?,
                share_to_feed: options.share_to_feed.unwrap_or(true),
            })),
        }
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            JobSpec::Image(_) => ContentType::Image,
            JobSpec::Carousel(_) => ContentType::Carousel,
            JobSpec::Reel(_) => ContentType::Reel,
        }
    }

    pub fn base(&self) -> &JobBase {
        match self {
            JobSpec::Image(job) => &job.base,
            JobSpec::Carousel(job) => &job.base,
            JobSpec::Reel(job) => &job.base,
        }
    }

    pub fn caption(&self) -> &str {
        &self.base().caption
    }

    /// Media references in submission order
    pub fn media_refs(&self) -> Vec<&MediaRef> {
        match self {
            JobSpec::Image(job) => vec![&job.media],
            JobSpec::Carousel(job) => job.items.iter().collect(),
            JobSpec::Reel(job) => vec![&job.video],
        }
    }
}

/// Options accepted alongside a submission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitOptions {
    #[serde(default)]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub share_to_feed: Option<bool>,
    #[serde(default)]
    pub owns_media: bool,
}

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    RateLimited,
    PolicyViolation,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::RateLimited
                | JobStatus::PolicyViolation
        )
    }

    /// Whether an operator may reset a job in this status back to pending
    pub fn is_resettable(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::RateLimited | JobStatus::PolicyViolation
        )
    }

    /// Allowed transitions: pending→processing, processing→terminal, and the
    /// explicit reset of a resettable terminal status back to pending.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Processing, next) => next.is_terminal(),
            (current, JobStatus::Pending) => current.is_resettable(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::RateLimited => "rate_limited",
            JobStatus::PolicyViolation => "policy_violation",
        };
        f.write_str(s)
    }
}

/// Successful publication details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    /// Remote post id
    pub id: String,
    pub permalink: Option<String>,
    pub container_id: String,
    /// The publish call reported failure but the post was found afterwards
    #[serde(default)]
    pub reconciled: bool,
}

/// Failure details attached to a terminal job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
    pub code: Option<i64>,
    pub subcode: Option<i64>,
    pub fbtrace_id: Option<String>,
    /// Recommended wait in seconds before replaying a rate-limited job
    pub retry_after: Option<u64>,
}

impl From<&PublishError> for JobError {
    fn from(error: &PublishError) -> Self {
        let detail = error.detail();
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            code: detail.and_then(|d| d.code),
            subcode: detail.and_then(|d| d.subcode),
            fbtrace_id: detail.and_then(|d| d.fbtrace_id.clone()),
            retry_after: error.retry_after().map(|d| d.as_secs()),
        }
    }
}

/// A unit of work owned by the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<JobResult>,
    pub error: Option<JobError>,
    /// Number of times the worker has picked this job up
    pub attempts: u32,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            spec,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.spec.content_type()
    }
}

/// Aggregate queue counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_jobs: u64,
    pub pending_jobs: u64,
    pub processing_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub rate_limited_jobs: u64,
    pub policy_violations: u64,
    pub by_content_type: HashMap<ContentType, u64>,
    pub average_processing_secs: f64,
}

/// Processing state of a remote container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerState {
    Created,
    InProgress,
    Finished,
    Error,
    Expired,
    /// Synthesized locally when polling runs out of attempts
    Timeout,
}

impl ContainerState {
    /// Map a remote `status_code` to a state; unknown codes count as in progress
    pub fn from_status_code(code: &str) -> Self {
        match code.to_uppercase().as_str() {
            "FINISHED" | "PUBLISHED" => ContainerState::Finished,
            "ERROR" => ContainerState::Error,
            "EXPIRED" => ContainerState::Expired,
            _ => ContainerState::InProgress,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContainerState::Finished
                | ContainerState::Error
                | ContainerState::Expired
                | ContainerState::Timeout
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "CREATED",
            ContainerState::InProgress => "IN_PROGRESS",
            ContainerState::Finished => "FINISHED",
            ContainerState::Error => "ERROR",
            ContainerState::Expired => "EXPIRED",
            ContainerState::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(items: &[&str]) -> Vec<MediaRef> {
        items.iter().map(|s| MediaRef::new(*s)).collect()
    }

    #[test]
    fn test_infer_content_type() {
        assert_eq!(ContentType::infer(&refs(&["a.jpg"])), ContentType::Image);
        assert_eq!(ContentType::infer(&refs(&["a.jpg", "b.jpg"])), ContentType::Carousel);
        assert_eq!(ContentType::infer(&refs(&["clip.MP4"])), ContentType::Reel);
        assert_eq!(
            ContentType::infer(&refs(&["https://cdn.example.com/v.mov?sig=1"])),
            ContentType::Reel
        );
    }

    #[test]
    fn test_media_ref_local_and_remote() {
        let remote = MediaRef::new("https://cdn.example.com/a.jpg");
        assert!(remote.is_remote());
        assert!(remote.local_path().is_none());

        let local = MediaRef::new("/tmp/a.jpg");
        assert!(!local.is_remote());
        assert_eq!(local.local_path(), Some(PathBuf::from("/tmp/a.jpg")));

        let file_url = MediaRef::new("file:///tmp/b.jpg");
        assert_eq!(file_url.local_path(), Some(PathBuf::from("/tmp/b.jpg")));
    }

    #[test]
    fn test_build_image_spec() {
        let spec = JobSpec::build(refs(&["a.jpg"]), "hello".to_string(), &SubmitOptions::default())
            .unwrap();
        assert_eq!(spec.content_type(), ContentType::Image);
        assert_eq!(spec.caption(), "hello");
        assert_eq!(spec.media_refs().len(), 1);
    }

    #[test]
    fn test_build_reel_defaults_share_to_feed() {
        let spec = JobSpec::build(refs(&["clip.mp4"]), String::new(), &SubmitOptions::default())
            .unwrap();
        match spec {
            JobSpec::Reel(reel) => assert!(reel.share_to_feed),
            other => panic!("Expected reel, got {:?}", other),
        }
    }

    #[test]
    fn test_build_explicit_carousel_with_one_item() {
        let options = SubmitOptions {
            content_type: Some(ContentType::Carousel),
            ..Default::default()
        };
        let spec = JobSpec::build(refs(&["a.jpg"]), String::new(), &options).unwrap();
        assert_eq!(spec.content_type(), ContentType::Carousel);
    }

    #[test]
    fn test_build_rejects_multiple_refs_for_image() {
        let options = SubmitOptions {
            content_type: Some(ContentType::Image),
            ..Default::default()
        };
        let result = JobSpec::build(refs(&["a.jpg", "b.jpg"]), String::new(), &options);
        assert!(matches!(result, Err(GramcastError::InvalidInput(_))));
    }

    #[test]
    fn test_build_rejects_empty_media() {
        let result = JobSpec::build(Vec::new(), String::new(), &SubmitOptions::default());
        assert!(matches!(result, Err(GramcastError::InvalidInput(_))));
    }

    #[test]
    fn test_job_spec_serializes_with_content_type_tag() {
        let spec = JobSpec::build(refs(&["a.jpg", "b.jpg"]), "hi".to_string(), &SubmitOptions::default())
            .unwrap();
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["content_type"], "carousel");
        assert_eq!(json["caption"], "hi");
        assert_eq!(json["items"][1], "b.jpg");
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::RateLimited));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn test_new_job_is_pending() {
        let spec = JobSpec::build(refs(&["a.jpg"]), String::new(), &SubmitOptions::default())
            .unwrap();
        let job = Job::new(spec);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.created_at, job.updated_at);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_container_state_from_status_code() {
        assert_eq!(ContainerState::from_status_code("FINISHED"), ContainerState::Finished);
        assert_eq!(ContainerState::from_status_code("PUBLISHED"), ContainerState::Finished);
        assert_eq!(ContainerState::from_status_code("ERROR"), ContainerState::Error);
        assert_eq!(ContainerState::from_status_code("EXPIRED"), ContainerState::Expired);
        assert_eq!(ContainerState::from_status_code("IN_PROGRESS"), ContainerState::InProgress);
        assert_eq!(ContainerState::from_status_code("SOMETHING_NEW"), ContainerState::InProgress);
    }

    #[test]
    fn test_job_error_from_rate_limit() {
        let error = PublishError::RateLimit {
            detail: crate::error::ApiErrorDetail {
                message: "limit".to_string(),
                code: Some(4),
                subcode: None,
                fbtrace_id: Some("T1".to_string()),
                http_status: Some(400),
            },
            retry_after: std::time::Duration::from_secs(900),
        };
        let job_error = JobError::from(&error);
        assert_eq!(job_error.kind, "rate_limit");
        assert_eq!(job_error.code, Some(4));
        assert_eq!(job_error.fbtrace_id.as_deref(), Some("T1"));
        assert_eq!(job_error.retry_after, Some(900));
    }
}
