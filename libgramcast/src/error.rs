//! Error types for Gramcast
//!
//! Two layers:
//! - [`GramcastError`] is what library entry points return (config loading,
//!   submission, queue lifecycle).
//! - [`PublishError`] is the tagged error kind produced by the publish
//!   pipeline. It carries the structured remote error fields so a failed job
//!   can report code, subcode, trace id and retry hint to an operator.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{ContainerState, JobStatus};

pub type Result<T> = std::result::Result<T, GramcastError>;

#[derive(Error, Debug)]
pub enum GramcastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Queue is shut down and no longer accepts jobs")]
    QueueClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GramcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            GramcastError::InvalidInput(_) | GramcastError::NotFound(_) => 3,
            GramcastError::Publish(e) if e.is_credential_failure() => 2,
            GramcastError::Config(_) => 2,
            GramcastError::Publish(_) => 1,
            GramcastError::QueueClosed => 1,
            GramcastError::Io(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Structured error fields returned by the remote API
///
/// Mirrors the `{error: {message, code, error_subcode, fbtrace_id}}` payload
/// plus the HTTP status the payload arrived with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub message: String,
    pub code: Option<i64>,
    pub subcode: Option<i64>,
    pub fbtrace_id: Option<String>,
    pub http_status: Option<u16>,
}

impl ApiErrorDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Parse the `error` object out of a response body, if present
    pub fn from_body(body: &serde_json::Value, http_status: u16) -> Option<Self> {
        let error = body.get("error")?;
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();

        Some(Self {
            message,
            code: error.get("code").and_then(|c| c.as_i64()),
            subcode: error.get("error_subcode").and_then(|c| c.as_i64()),
            fbtrace_id: error
                .get("fbtrace_id")
                .and_then(|t| t.as_str())
                .map(str::to_string),
            http_status: Some(http_status),
        })
    }
}

impl fmt::Display for ApiErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        let mut parts = Vec::new();
        if let Some(code) = self.code {
            parts.push(format!("Code: {}", code));
        }
        if let Some(subcode) = self.subcode {
            parts.push(format!("Subcode: {}", subcode));
        }
        if let Some(trace) = &self.fbtrace_id {
            parts.push(format!("Trace: {}", trace));
        }
        if !parts.is_empty() {
            write!(f, " ({})", parts.join(", "))?;
        }
        Ok(())
    }
}

/// Error kinds produced by the publish pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PublishError {
    #[error("Authentication failed: {0}")]
    Authentication(ApiErrorDetail),

    #[error("Permission denied: {0}")]
    Permission(ApiErrorDetail),

    #[error("Rate limit exceeded: {detail} (retry after {}s)", .retry_after.as_secs())]
    RateLimit {
        detail: ApiErrorDetail,
        retry_after: Duration,
    },

    #[error("Media rejected: {0}")]
    Media(ApiErrorDetail),

    #[error("Validation failed: {0}")]
    Validation(ApiErrorDetail),

    #[error("Content policy violation: {0}")]
    PolicyViolation(ApiErrorDetail),

    #[error("Temporary server error: {0}")]
    TemporaryServer(ApiErrorDetail),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Carousel creation failed: {message}")]
    CarouselCreation {
        message: String,
        detail: Option<ApiErrorDetail>,
    },

    #[error("Carousel publish failed: {message}")]
    CarouselPublish {
        message: String,
        detail: Option<ApiErrorDetail>,
    },

    #[error("Container {container_id} did not finish processing (final status: {state})")]
    ContainerFailed {
        container_id: String,
        state: ContainerState,
    },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Cancelled by shutdown")]
    Cancelled,
}

/// Outcome of classifying a remote error payload
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Return the error to the caller without retrying
    Fatal(PublishError),
    /// Retry within the attempt budget
    Transient(ApiErrorDetail),
}

const AUTH_CODES: &[i64] = &[102, 190];
const RATE_LIMIT_CODES: &[i64] = &[4, 17, 32, 613];
const TRANSIENT_CODES: &[i64] = &[1, 2];
const MEDIA_CODES: &[i64] = &[9004, 324, 352, 36000, 36001, 36002, 36003];

const APP_QUOTA_SUBCODE: i64 = 2207051;
const CAROUSEL_CREATION_CODE: i64 = 2207024;
const CAROUSEL_PUBLISH_CODE: i64 = 35001;
const POLICY_CODE: i64 = 368;
const INVALID_PARAMETER_CODE: i64 = 100;

const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(300);
const APP_QUOTA_MIN_WAIT_SECS: u64 = 5 * 60;
const APP_QUOTA_MAX_WAIT_SECS: u64 = 15 * 60;

fn in_range(value: Option<i64>, low: i64, high: i64) -> bool {
    value.map(|v| (low..=high).contains(&v)).unwrap_or(false)
}

fn matches_any(value: Option<i64>, codes: &[i64]) -> bool {
    value.map(|v| codes.contains(&v)).unwrap_or(false)
}

/// Work out how long a rate-limited caller should wait
///
/// Prefers an explicit `retry_after` in the payload, then the HTTP
/// `Retry-After` header, then a randomized 5-15 minute window for the
/// application-wide quota subcode, then a flat 5 minutes.
pub fn rate_limit_wait(
    body: &serde_json::Value,
    detail: &ApiErrorDetail,
    header_hint: Option<Duration>,
) -> Duration {
    if let Some(secs) = body
        .get("error")
        .and_then(|e| e.get("retry_after"))
        .and_then(|r| r.as_u64())
    {
        return Duration::from_secs(secs);
    }

    if let Some(hint) = header_hint {
        return hint;
    }

    if detail.subcode == Some(APP_QUOTA_SUBCODE) {
        let secs = rand::thread_rng().gen_range(APP_QUOTA_MIN_WAIT_SECS..=APP_QUOTA_MAX_WAIT_SECS);
        return Duration::from_secs(secs);
    }

    DEFAULT_RATE_LIMIT_WAIT
}

/// Classify a structured remote error into the publish error taxonomy
///
/// # Arguments
///
/// * `detail` - Parsed error fields
/// * `body` - Full response body (consulted for `retry_after`)
/// * `header_hint` - `Retry-After` header value, if the transport saw one
pub fn classify(
    detail: ApiErrorDetail,
    body: &serde_json::Value,
    header_hint: Option<Duration>,
) -> Classification {
    let code = detail.code;
    let subcode = detail.subcode;

    if matches_any(code, AUTH_CODES) {
        return Classification::Fatal(PublishError::Authentication(detail));
    }

    if matches_any(code, &[10, 803]) || in_range(code, 200, 299) {
        return Classification::Fatal(PublishError::Permission(detail));
    }

    if matches_any(code, RATE_LIMIT_CODES) || subcode == Some(APP_QUOTA_SUBCODE) {
        let retry_after = rate_limit_wait(body, &detail, header_hint);
        return Classification::Fatal(PublishError::RateLimit {
            detail,
            retry_after,
        });
    }

    if code == Some(POLICY_CODE) {
        return Classification::Fatal(PublishError::PolicyViolation(detail));
    }

    if code == Some(CAROUSEL_CREATION_CODE) || subcode == Some(CAROUSEL_CREATION_CODE) {
        return Classification::Fatal(PublishError::CarouselCreation {
            message: detail.message.clone(),
            detail: Some(detail),
        });
    }

    if code == Some(CAROUSEL_PUBLISH_CODE) || subcode == Some(CAROUSEL_PUBLISH_CODE) {
        return Classification::Fatal(PublishError::CarouselPublish {
            message: detail.message.clone(),
            detail: Some(detail),
        });
    }

    if matches_any(code, MEDIA_CODES)
        || in_range(code, 2208001, 2208999)
        || in_range(subcode, 2208001, 2208999)
    {
        return Classification::Fatal(PublishError::Media(detail));
    }

    if code == Some(INVALID_PARAMETER_CODE)
        || in_range(code, 2207001, 2207999)
        || in_range(subcode, 2207001, 2207999)
    {
        return Classification::Fatal(PublishError::Validation(detail));
    }

    if matches_any(code, TRANSIENT_CODES) {
        return Classification::Transient(detail);
    }

    debug!(code = ?code, subcode = ?subcode, "Unrecognised error code, treating as transient");
    Classification::Transient(detail)
}

/// Classify a non-2xx response that carried no structured error payload
pub fn classify_status(status: u16, header_hint: Option<Duration>) -> Classification {
    let detail = ApiErrorDetail {
        message: format!("HTTP {}", status),
        http_status: Some(status),
        ..Default::default()
    };

    match status {
        429 => Classification::Fatal(PublishError::RateLimit {
            detail,
            retry_after: header_hint.unwrap_or(DEFAULT_RATE_LIMIT_WAIT),
        }),
        500..=599 => Classification::Transient(detail),
        _ => Classification::Fatal(PublishError::Validation(detail)),
    }
}

impl PublishError {
    /// Remote error fields, when the error came from an API payload
    pub fn detail(&self) -> Option<&ApiErrorDetail> {
        match self {
            PublishError::Authentication(d)
            | PublishError::Permission(d)
            | PublishError::Media(d)
            | PublishError::Validation(d)
            | PublishError::PolicyViolation(d)
            | PublishError::TemporaryServer(d) => Some(d),
            PublishError::RateLimit { detail, .. } => Some(detail),
            PublishError::CarouselCreation { detail, .. }
            | PublishError::CarouselPublish { detail, .. } => detail.as_ref(),
            PublishError::Transport(_)
            | PublishError::ContainerFailed { .. }
            | PublishError::MalformedResponse(_)
            | PublishError::Cancelled => None,
        }
    }

    /// Short machine-readable kind name
    pub fn kind(&self) -> &'static str {
        match self {
            PublishError::Authentication(_) => "authentication",
            PublishError::Permission(_) => "permission",
            PublishError::RateLimit { .. } => "rate_limit",
            PublishError::Media(_) => "media",
            PublishError::Validation(_) => "validation",
            PublishError::PolicyViolation(_) => "policy_violation",
            PublishError::TemporaryServer(_) => "temporary_server",
            PublishError::Transport(_) => "transport",
            PublishError::CarouselCreation { .. } => "carousel_creation",
            PublishError::CarouselPublish { .. } => "carousel_publish",
            PublishError::ContainerFailed { .. } => "container_failed",
            PublishError::MalformedResponse(_) => "malformed_response",
            PublishError::Cancelled => "cancelled",
        }
    }

    /// Suggested wait before an operator replays the job
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PublishError::RateLimit { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Terminal job status this error maps to
    pub fn job_status(&self) -> JobStatus {
        match self {
            PublishError::RateLimit { .. } => JobStatus::RateLimited,
            PublishError::PolicyViolation(_) => JobStatus::PolicyViolation,
            _ => JobStatus::Failed,
        }
    }

    /// The remote answered with HTTP 400 or 403, which has been seen on
    /// calls that actually went through.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self.detail().and_then(|d| d.http_status),
            Some(400) | Some(403)
        )
    }

    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            PublishError::Authentication(_) | PublishError::Permission(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detail(code: i64, subcode: Option<i64>) -> ApiErrorDetail {
        ApiErrorDetail {
            message: "boom".to_string(),
            code: Some(code),
            subcode,
            fbtrace_id: Some("TRACE".to_string()),
            http_status: Some(400),
        }
    }

    fn classify_code(code: i64, subcode: Option<i64>) -> Classification {
        classify(detail(code, subcode), &json!({}), None)
    }

    #[test]
    fn test_exit_code_invalid_input() {
        let error = GramcastError::InvalidInput("No media".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_not_found() {
        let error = GramcastError::NotFound("/tmp/missing.jpg".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_authentication_error() {
        let error = GramcastError::Publish(PublishError::Authentication(detail(190, None)));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_media_error() {
        let error = GramcastError::Publish(PublishError::Media(detail(9004, None)));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn test_detail_display_includes_codes() {
        let message = detail(4, Some(2207051)).to_string();
        assert_eq!(message, "boom (Code: 4, Subcode: 2207051, Trace: TRACE)");
    }

    #[test]
    fn test_detail_display_without_codes() {
        assert_eq!(ApiErrorDetail::new("plain").to_string(), "plain");
    }

    #[test]
    fn test_detail_from_body() {
        let body = json!({
            "error": {
                "message": "Invalid OAuth access token",
                "code": 190,
                "error_subcode": 463,
                "fbtrace_id": "AbC"
            }
        });
        let parsed = ApiErrorDetail::from_body(&body, 400).unwrap();
        assert_eq!(parsed.message, "Invalid OAuth access token");
        assert_eq!(parsed.code, Some(190));
        assert_eq!(parsed.subcode, Some(463));
        assert_eq!(parsed.fbtrace_id.as_deref(), Some("AbC"));
        assert_eq!(parsed.http_status, Some(400));
    }

    #[test]
    fn test_detail_from_body_without_error() {
        assert!(ApiErrorDetail::from_body(&json!({"id": "1"}), 200).is_none());
    }

    #[test]
    fn test_classify_authentication() {
        for code in [102, 190] {
            assert!(matches!(
                classify_code(code, None),
                Classification::Fatal(PublishError::Authentication(_))
            ));
        }
    }

    #[test]
    fn test_classify_permission() {
        for code in [10, 200, 203, 299, 803] {
            assert!(matches!(
                classify_code(code, None),
                Classification::Fatal(PublishError::Permission(_))
            ));
        }
    }

    #[test]
    fn test_classify_rate_limit_uses_payload_retry_after() {
        let body = json!({"error": {"message": "slow down", "code": 4, "retry_after": 900}});
        let result = classify(detail(4, None), &body, None);
        match result {
            Classification::Fatal(PublishError::RateLimit { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(900));
            }
            other => panic!("Expected rate limit, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_rate_limit_uses_header_hint() {
        let result = classify(detail(17, None), &json!({}), Some(Duration::from_secs(42)));
        assert_eq!(
            match result {
                Classification::Fatal(e) => e.retry_after(),
                _ => None,
            },
            Some(Duration::from_secs(42))
        );
    }

    #[test]
    fn test_classify_app_quota_subcode_waits_five_to_fifteen_minutes() {
        for _ in 0..20 {
            let result = classify(detail(9, Some(2207051)), &json!({}), None);
            let wait = match result {
                Classification::Fatal(e) => e.retry_after().unwrap(),
                other => panic!("Expected fatal rate limit, got {:?}", other),
            };
            assert!(wait >= Duration::from_secs(300));
            assert!(wait <= Duration::from_secs(900));
        }
    }

    #[test]
    fn test_classify_rate_limit_default_wait() {
        let result = classify(detail(613, None), &json!({}), None);
        match result {
            Classification::Fatal(e) => assert_eq!(e.retry_after(), Some(Duration::from_secs(300))),
            other => panic!("Expected fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_media_and_validation_ranges() {
        assert!(matches!(
            classify_code(2208010, None),
            Classification::Fatal(PublishError::Media(_))
        ));
        assert!(matches!(
            classify_code(36003, None),
            Classification::Fatal(PublishError::Media(_))
        ));
        assert!(matches!(
            classify_code(9, Some(2207026)),
            Classification::Fatal(PublishError::Validation(_))
        ));
        assert!(matches!(
            classify_code(100, None),
            Classification::Fatal(PublishError::Validation(_))
        ));
    }

    #[test]
    fn test_classify_carousel_specific_codes() {
        assert!(matches!(
            classify_code(9, Some(2207024)),
            Classification::Fatal(PublishError::CarouselCreation { .. })
        ));
        assert!(matches!(
            classify_code(35001, None),
            Classification::Fatal(PublishError::CarouselPublish { .. })
        ));
    }

    #[test]
    fn test_classify_policy_violation() {
        let result = classify_code(368, None);
        match result {
            Classification::Fatal(e) => assert_eq!(e.job_status(), JobStatus::PolicyViolation),
            other => panic!("Expected fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_transient_and_unknown() {
        assert!(matches!(classify_code(1, None), Classification::Transient(_)));
        assert!(matches!(classify_code(2, None), Classification::Transient(_)));
        assert!(matches!(classify_code(999_999, None), Classification::Transient(_)));
    }

    #[test]
    fn test_classify_status_without_payload() {
        assert!(matches!(classify_status(503, None), Classification::Transient(_)));
        assert!(matches!(
            classify_status(429, None),
            Classification::Fatal(PublishError::RateLimit { .. })
        ));
        assert!(matches!(
            classify_status(404, None),
            Classification::Fatal(PublishError::Validation(_))
        ));
    }

    #[test]
    fn test_job_status_mapping() {
        let rate_limited = PublishError::RateLimit {
            detail: detail(4, None),
            retry_after: Duration::from_secs(60),
        };
        assert_eq!(rate_limited.job_status(), JobStatus::RateLimited);
        assert_eq!(PublishError::Cancelled.job_status(), JobStatus::Failed);
        assert_eq!(
            PublishError::Transport("timeout".to_string()).job_status(),
            JobStatus::Failed
        );
    }

    #[test]
    fn test_is_ambiguous() {
        let mut forbidden = detail(10, None);
        forbidden.http_status = Some(403);
        assert!(PublishError::Permission(forbidden).is_ambiguous());

        let mut server = detail(1, None);
        server.http_status = Some(500);
        assert!(!PublishError::TemporaryServer(server).is_ambiguous());
        assert!(!PublishError::Transport("reset".to_string()).is_ambiguous());
    }

    #[test]
    fn test_error_conversion_from_publish_error() {
        let error: GramcastError = PublishError::Cancelled.into();
        assert!(matches!(error, GramcastError::Publish(PublishError::Cancelled)));
    }

    #[test]
    fn test_rate_limit_message_includes_wait() {
        let error = PublishError::RateLimit {
            detail: ApiErrorDetail::new("Application request limit reached"),
            retry_after: Duration::from_secs(900),
        };
        assert_eq!(
            error.to_string(),
            "Rate limit exceeded: Application request limit reached (retry after 900s)"
        );
    }
}
