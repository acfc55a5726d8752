//! Remote API client with retry, classification and rate-limit accounting
//!
//! [`PublishClient::call`] is the only place that talks to a
//! [`GraphTransport`]. For every attempt it:
//!
//! 1. waits out any cooldown the [`RateLimitTracker`] holds for the endpoint
//! 2. sends the request with the access token attached
//! 3. classifies the outcome: success, fatal error (returned immediately),
//!    rate limit (returned immediately with its `retry_after`), or transient
//!    (retried with exponential backoff until the budget runs out)
//! 4. records the outcome against the tracker
//!
//! All sleeps are cancellable through the shared shutdown token.

use secrecy::SecretString;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{classify, classify_status, ApiErrorDetail, Classification, PublishError};
use crate::rate_limiter::{apply_jitter, exponential_delay, RateLimitTracker};
use crate::transport::{ApiRequest, ApiResponse, GraphTransport, HttpMethod};

/// Fields requested when listing recent posts for reconciliation
const RECENT_MEDIA_FIELDS: &str = "id,caption,timestamp,permalink,media_type";

/// Remote endpoints the pipeline calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `POST /{account_id}/media`
    CreateContainer,
    /// `GET /{container_id}?fields=status_code,status`
    ContainerStatus { container_id: String },
    /// `POST /{account_id}/media_publish`
    Publish,
    /// `GET /{post_id}?fields=permalink`
    Permalink { post_id: String },
    /// `GET /{account_id}/media?fields=...`
    RecentMedia,
}

impl Endpoint {
    pub fn method(&self) -> HttpMethod {
        match self {
            Endpoint::CreateContainer | Endpoint::Publish => HttpMethod::Post,
            Endpoint::ContainerStatus { .. }
            | Endpoint::Permalink { .. }
            | Endpoint::RecentMedia => HttpMethod::Get,
        }
    }

    pub fn path(&self, account_id: &str) -> String {
        match self {
            Endpoint::CreateContainer => format!("/{}/media", account_id),
            Endpoint::ContainerStatus { container_id } => format!("/{}", container_id),
            Endpoint::Publish => format!("/{}/media_publish", account_id),
            Endpoint::Permalink { post_id } => format!("/{}", post_id),
            Endpoint::RecentMedia => format!("/{}/media", account_id),
        }
    }

    /// Rate-limit bucket; ids are left out so all status checks share one window
    pub fn bucket(&self) -> &'static str {
        match self {
            Endpoint::CreateContainer => "media",
            Endpoint::ContainerStatus { .. } => "container_status",
            Endpoint::Publish => "media_publish",
            Endpoint::Permalink { .. } => "permalink",
            Endpoint::RecentMedia => "recent_media",
        }
    }
}

/// Attempt budget and backoff shape for a single call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on one attempt, used for worst-case estimates
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            attempt_timeout,
        }
    }

    /// Jittered delay after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        apply_jitter(exponential_delay(self.base_delay, self.max_delay, attempt))
    }

    /// Longest a single call can take, excluding rate-limit cooldowns
    pub fn worst_case(&self) -> Duration {
        let sleeps: Duration = (1..self.max_attempts)
            .map(|attempt| exponential_delay(self.base_delay, self.max_delay, attempt).mul_f64(1.1))
            .sum();
        self.attempt_timeout.saturating_mul(self.max_attempts) + sleeps
    }
}

/// Status check response
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerStatusReport {
    pub status_code: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// A post as listed by the recent-media endpoint
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RemotePost {
    pub id: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecentMediaPage {
    #[serde(default)]
    data: Vec<RemotePost>,
}

pub struct PublishClient {
    transport: Arc<dyn GraphTransport>,
    access_token: SecretString,
    account_id: String,
    tracker: Arc<RateLimitTracker>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl PublishClient {
    pub fn new(
        transport: Arc<dyn GraphTransport>,
        access_token: SecretString,
        account_id: impl Into<String>,
        tracker: Arc<RateLimitTracker>,
        retry: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            access_token,
            account_id: account_id.into(),
            tracker,
            retry,
            shutdown,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn tracker(&self) -> &Arc<RateLimitTracker> {
        &self.tracker
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Sleep unless shutdown is requested first
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Cancelled`] if the shutdown token fires.
    pub async fn sleep(&self, duration: Duration) -> Result<(), PublishError> {
        if self.shutdown.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(PublishError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn interpret(response: ApiResponse) -> Result<Value, Classification> {
        if let Some(detail) = ApiErrorDetail::from_body(&response.body, response.status) {
            return Err(classify(detail, &response.body, response.retry_after));
        }
        if !response.is_success() {
            return Err(classify_status(response.status, response.retry_after));
        }
        Ok(response.body)
    }

    /// Call an endpoint with the retry budget
    ///
    /// # Errors
    ///
    /// Fatal and rate-limit errors are returned on the attempt that produced
    /// them. Transient errors are returned as `TemporaryServer` or `Transport`
    /// once every attempt has failed.
    pub async fn call(
        &self,
        endpoint: &Endpoint,
        params: Vec<(String, String)>,
    ) -> Result<Value, PublishError> {
        let bucket = endpoint.bucket();
        let request = ApiRequest {
            method: endpoint.method(),
            path: endpoint.path(&self.account_id),
            params,
        };
        let max_attempts = self.retry.max_attempts;
        let mut last_error = PublishError::Transport("no attempt was made".to_string());

        for attempt in 1..=max_attempts {
            let (must_wait, remaining) = self.tracker.should_backoff(bucket);
            if must_wait {
                debug!(
                    endpoint = bucket,
                    wait_ms = remaining.as_millis() as u64,
                    "Endpoint cooling down, waiting before call"
                );
                self.sleep(remaining).await?;
            }
            if self.shutdown.is_cancelled() {
                return Err(PublishError::Cancelled);
            }

            match self.transport.send(&request, &self.access_token).await {
                Ok(response) => match Self::interpret(response) {
                    Ok(body) => {
                        self.tracker.record_success(bucket);
                        if attempt > 1 {
                            info!(endpoint = bucket, attempt, "Call succeeded after retry");
                        }
                        return Ok(body);
                    }
                    Err(Classification::Fatal(error)) => {
                        match &error {
                            PublishError::RateLimit { retry_after, .. } => {
                                self.tracker.record_rate_limit(bucket, *retry_after);
                            }
                            _ => {
                                self.tracker.record_error(bucket);
                            }
                        }
                        warn!(endpoint = bucket, attempt, kind = error.kind(), "Call failed: {}", error);
                        return Err(error);
                    }
                    Err(Classification::Transient(detail)) => {
                        self.tracker.record_error(bucket);
                        last_error = PublishError::TemporaryServer(detail);
                    }
                },
                Err(transport_error) => {
                    self.tracker.record_error(bucket);
                    last_error = PublishError::Transport(transport_error.to_string());
                }
            }

            if attempt < max_attempts {
                let delay = self.retry.delay_for(attempt);
                warn!(
                    endpoint = bucket,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient error: {}. Retrying",
                    last_error
                );
                self.sleep(delay).await?;
            }
        }

        warn!(endpoint = bucket, max_attempts, "Giving up after {} attempts: {}", max_attempts, last_error);
        Err(last_error)
    }

    fn string_field(body: &Value, field: &str) -> Result<String, PublishError> {
        body.get(field)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| PublishError::MalformedResponse(format!("response has no '{}' field: {}", field, body)))
    }

    /// Create a media container and return its id
    pub async fn create_container(&self, params: Vec<(String, String)>) -> Result<String, PublishError> {
        let body = self.call(&Endpoint::CreateContainer, params).await?;
        Self::string_field(&body, "id")
    }

    pub async fn container_status(&self, container_id: &str) -> Result<ContainerStatusReport, PublishError> {
        let endpoint = Endpoint::ContainerStatus {
            container_id: container_id.to_string(),
        };
        let body = self
            .call(&endpoint, vec![("fields".to_string(), "status_code,status".to_string())])
            .await?;
        serde_json::from_value(body.clone())
            .map_err(|e| PublishError::MalformedResponse(format!("bad status response {}: {}", body, e)))
    }

    /// Publish a finished container and return the post id
    pub async fn publish_container(&self, creation_id: &str) -> Result<String, PublishError> {
        let body = self
            .call(
                &Endpoint::Publish,
                vec![("creation_id".to_string(), creation_id.to_string())],
            )
            .await?;
        Self::string_field(&body, "id")
    }

    pub async fn permalink(&self, post_id: &str) -> Result<Option<String>, PublishError> {
        let endpoint = Endpoint::Permalink {
            post_id: post_id.to_string(),
        };
        let body = self
            .call(&endpoint, vec![("fields".to_string(), "permalink".to_string())])
            .await?;
        Ok(body.get("permalink").and_then(|p| p.as_str()).map(str::to_string))
    }

    /// The account's most recent posts, newest first
    pub async fn recent_media(&self, limit: u32) -> Result<Vec<RemotePost>, PublishError> {
        let body = self
            .call(
                &Endpoint::RecentMedia,
                vec![
                    ("fields".to_string(), RECENT_MEDIA_FIELDS.to_string()),
                    ("limit".to_string(), limit.to_string()),
                ],
            )
            .await?;
        let page: RecentMediaPage = serde_json::from_value(body.clone())
            .map_err(|e| PublishError::MalformedResponse(format!("bad media list {}: {}", body, e)))?;
        Ok(page.data)
    }
}
