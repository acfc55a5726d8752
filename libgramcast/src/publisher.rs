//! Per-content-type publish pipelines
//!
//! Every pipeline runs the same fixed sequence of remote steps and never
//! goes back to an earlier one:
//!
//! ```text
//! image:    create ─▶ poll ─▶ publish ─▶ permalink
//! carousel: create children ─▶ create parent ─▶ poll ─▶ publish ─▶ permalink
//! reel:     create ─▶ poll (longer budget) ─▶ publish ─▶ permalink
//! ```
//!
//! A publish call answered with HTTP 400 or 403 goes through the
//! [`PublicationVerifier`] before it is allowed to fail the job.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::PublishClient;
use crate::config::PublishingConfig;
use crate::error::{ApiErrorDetail, PublishError};
use crate::media::MediaResolver;
use crate::poller::ContainerStatusPoller;
use crate::types::{CarouselJob, ImageJob, JobSpec, MediaRef, ReelJob};
use crate::verifier::PublicationVerifier;

/// What a successful pipeline run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub post_id: String,
    pub permalink: Option<String>,
    pub container_id: String,
    /// The publish call failed but the verifier found the post
    pub reconciled: bool,
}

/// Turns a job spec into a published post
///
/// The queue worker only depends on this trait, so tests can drive the
/// queue with a scripted processor.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, spec: &JobSpec) -> Result<PublishOutcome, PublishError>;

    /// Deterministic upper bound on `process`, excluding rate-limit pauses
    fn worst_case_duration(&self, spec: &JobSpec) -> Duration;
}

/// Cut a caption to `limit` characters, ending it with `...` when cut
pub fn truncate_caption(caption: &str, limit: usize) -> String {
    if caption.chars().count() <= limit {
        return caption.to_string();
    }
    let kept: String = caption.chars().take(limit.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn param(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_string(), value.into())
}

/// Child failures that end the whole carousel instead of skipping one item
fn aborts_carousel(error: &PublishError) -> bool {
    matches!(
        error,
        PublishError::Authentication(_)
            | PublishError::Permission(_)
            | PublishError::RateLimit { .. }
            | PublishError::PolicyViolation(_)
            | PublishError::Cancelled
    )
}

fn is_transient(error: &PublishError) -> bool {
    matches!(
        error,
        PublishError::TemporaryServer(_) | PublishError::Transport(_) | PublishError::MalformedResponse(_)
    )
}

fn carousel_creation_error(error: PublishError) -> PublishError {
    if is_transient(&error) {
        PublishError::CarouselCreation {
            message: error.to_string(),
            detail: error.detail().cloned(),
        }
    } else {
        error
    }
}

fn carousel_publish_error(error: PublishError) -> PublishError {
    if is_transient(&error) {
        PublishError::CarouselPublish {
            message: error.to_string(),
            detail: error.detail().cloned(),
        }
    } else {
        error
    }
}

pub struct MediaPublisher {
    client: Arc<PublishClient>,
    image_poller: ContainerStatusPoller,
    reel_poller: ContainerStatusPoller,
    verifier: Arc<PublicationVerifier>,
    resolver: MediaResolver,
    settings: PublishingConfig,
}

impl MediaPublisher {
    pub fn new(
        client: Arc<PublishClient>,
        image_poller: ContainerStatusPoller,
        reel_poller: ContainerStatusPoller,
        verifier: Arc<PublicationVerifier>,
        resolver: MediaResolver,
        settings: PublishingConfig,
    ) -> Self {
        Self {
            client,
            image_poller,
            reel_poller,
            verifier,
            resolver,
            settings,
        }
    }

    fn caption(&self, caption: &str) -> String {
        let truncated = truncate_caption(caption, self.settings.caption_limit);
        if truncated.len() != caption.len() {
            warn!(
                limit = self.settings.caption_limit,
                original_chars = caption.chars().count(),
                "Caption exceeds the limit and was truncated"
            );
        }
        truncated
    }

    /// Publish any job spec
    pub async fn publish(&self, spec: &JobSpec) -> Result<PublishOutcome, PublishError> {
        match spec {
            JobSpec::Image(job) => self.publish_image(job).await,
            JobSpec::Carousel(job) => self.publish_carousel(job).await,
            JobSpec::Reel(job) => self.publish_reel(job).await,
        }
    }

    async fn publish_image(&self, job: &ImageJob) -> Result<PublishOutcome, PublishError> {
        let url = self.resolver.public_url(&job.media)?;
        let mut params = vec![param("image_url", url)];
        if !job.base.caption.is_empty() {
            params.push(param("caption", self.caption(&job.base.caption)));
        }

        let container_id = self.client.create_container(params).await?;
        info!(container_id = %container_id, "Image container created");

        let outcome = self.image_poller.poll(&container_id).await?;
        if !outcome.is_finished() {
            return Err(PublishError::ContainerFailed {
                container_id,
                state: outcome.state,
            });
        }

        self.publish_finished(&container_id, |e| e).await
    }

    async fn publish_reel(&self, job: &ReelJob) -> Result<PublishOutcome, PublishError> {
        let url = self.resolver.public_url(&job.video)?;
        let mut params = vec![
            param("media_type", "REELS"),
            param("video_url", url),
            param("share_to_feed", job.share_to_feed.to_string()),
        ];
        if !job.base.caption.is_empty() {
            params.push(param("caption", self.caption(&job.base.caption)));
        }

        let container_id = self.client.create_container(params).await?;
        info!(container_id = %container_id, share_to_feed = job.share_to_feed, "Reel container created");

        let outcome = self.reel_poller.poll(&container_id).await?;
        if !outcome.is_finished() {
            return Err(PublishError::ContainerFailed {
                container_id,
                state: outcome.state,
            });
        }

        self.publish_finished(&container_id, |e| e).await
    }

    /// Items that will actually be sent: capped at the configured maximum
    /// and limited to references that still resolve
    fn carousel_items<'a>(&self, job: &'a CarouselJob) -> Vec<&'a MediaRef> {
        let max = self.settings.max_carousel_items;
        if job.items.len() > max {
            warn!(
                submitted = job.items.len(),
                max, "Carousel has too many items, keeping the first {}", max
            );
        }

        job.items
            .iter()
            .take(max)
            .filter(|item| {
                let usable = MediaResolver::is_resolvable(item);
                if !usable {
                    warn!(media = %item, "Skipping carousel item that no longer resolves");
                }
                usable
            })
            .collect()
    }

    async fn create_child(&self, media: &MediaRef) -> Result<String, PublishError> {
        let url = self.resolver.public_url(media)?;
        let mut params = vec![param("is_carousel_item", "true")];
        if media.is_video() {
            params.push(param("media_type", "VIDEO"));
            params.push(param("video_url", url));
        } else {
            params.push(param("image_url", url));
        }
        self.client.create_container(params).await
    }

    async fn publish_carousel(&self, job: &CarouselJob) -> Result<PublishOutcome, PublishError> {
        let items = self.carousel_items(job);
        if items.len() < 2 {
            return Err(PublishError::Media(ApiErrorDetail::new(format!(
                "A carousel needs at least 2 usable media items, got {}",
                items.len()
            ))));
        }

        let too_few_children = |created: usize| PublishError::CarouselCreation {
            message: format!("only {} of {} child containers were created", created, items.len()),
            detail: None,
        };

        let mut children = Vec::with_capacity(items.len());
        for (index, media) in items.iter().enumerate() {
            // Stop once the rest cannot bring the carousel up to two children
            if children.len() + (items.len() - index) < 2 {
                return Err(too_few_children(children.len()));
            }
            if index > 0 {
                self.client.sleep(self.settings.child_delay).await?;
            }
            match self.create_child(media).await {
                Ok(child_id) => {
                    debug!(child_id = %child_id, position = index + 1, "Carousel child created");
                    children.push(child_id);
                }
                Err(e) if aborts_carousel(&e) => return Err(e),
                Err(e) => {
                    warn!(media = %media, position = index + 1, "Skipping carousel child: {}", e);
                }
            }
        }

        if children.len() < 2 {
            return Err(too_few_children(children.len()));
        }

        let mut params = vec![
            param("media_type", "CAROUSEL"),
            param("children", children.join(",")),
        ];
        if !job.base.caption.is_empty() {
            params.push(param("caption", self.caption(&job.base.caption)));
        }

        let container_id = self
            .client
            .create_container(params)
            .await
            .map_err(carousel_creation_error)?;
        info!(container_id = %container_id, children = children.len(), "Carousel container created");

        let outcome = self
            .image_poller
            .poll(&container_id)
            .await
            .map_err(carousel_creation_error)?;
        if !outcome.is_finished() {
            return Err(PublishError::CarouselCreation {
                message: format!(
                    "carousel container {} did not finish processing. Final status: {}",
                    container_id, outcome.state
                ),
                detail: None,
            });
        }

        self.publish_finished(&container_id, carousel_publish_error).await
    }

    /// Publish a FINISHED container, reconciling ambiguous failures
    async fn publish_finished(
        &self,
        container_id: &str,
        wrap: fn(PublishError) -> PublishError,
    ) -> Result<PublishOutcome, PublishError> {
        self.verifier.record_attempt(container_id);

        let (post_id, known_permalink, reconciled) = match self.client.publish_container(container_id).await {
            Ok(post_id) => {
                self.verifier.note_published(&post_id);
                (post_id, None, false)
            }
            Err(e) if e.is_ambiguous() => {
                warn!(container_id, kind = e.kind(), "Publish reported {}, checking whether it went through", e);
                match self.verifier.check_after_error(container_id).await? {
                    Some(found) => (found.post_id, found.permalink, true),
                    None => return Err(wrap(e)),
                }
            }
            Err(e) => return Err(wrap(e)),
        };

        info!(container_id, post_id = %post_id, reconciled, "Container published");

        let permalink = match known_permalink {
            Some(link) => Some(link),
            None => self.fetch_permalink(&post_id).await,
        };

        Ok(PublishOutcome {
            post_id,
            permalink,
            container_id: container_id.to_string(),
            reconciled,
        })
    }

    async fn fetch_permalink(&self, post_id: &str) -> Option<String> {
        match self.client.permalink(post_id).await {
            Ok(link) => link,
            Err(e) => {
                warn!(post_id, "Could not fetch permalink: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl JobProcessor for MediaPublisher {
    async fn process(&self, spec: &JobSpec) -> Result<PublishOutcome, PublishError> {
        self.publish(spec).await
    }

    fn worst_case_duration(&self, spec: &JobSpec) -> Duration {
        let call = self.client.retry_policy().worst_case();
        // publish + reconciliation + permalink
        let finish = call + self.verifier.worst_case() + call;

        match spec {
            JobSpec::Image(_) => call + self.image_poller.worst_case() + finish,
            JobSpec::Reel(_) => call + self.reel_poller.worst_case() + finish,
            JobSpec::Carousel(job) => {
                let children = job.items.len().min(self.settings.max_carousel_items) as u32;
                let creation = call.saturating_mul(children)
                    + self.settings.child_delay.saturating_mul(children.saturating_sub(1));
                creation + call + self.image_poller.worst_case() + finish
            }
        }
    }
}
