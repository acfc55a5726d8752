//! Service facade
//!
//! `GramcastService` wires every component from one [`Config`] exactly
//! once: transport, rate-limit tracker, client, pollers, verifier,
//! publisher and queue. The binaries only ever talk to this type.
//!
//! # Example
//!
//! ```no_run
//! use libgramcast::service::GramcastService;
//! use libgramcast::Config;
//!
//! # async fn example() -> libgramcast::Result<()> {
//! let service = GramcastService::from_config(Config::load()?)?;
//! println!("{} jobs so far", service.queue().get_stats().total_jobs);
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{PublishClient, RetryPolicy};
use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::media::MediaResolver;
use crate::poller::ContainerStatusPoller;
use crate::publisher::MediaPublisher;
use crate::queue::events::EventReceiver;
use crate::queue::{JobQueue, QueueOptions};
use crate::rate_limiter::RateLimitTracker;
use crate::transport::http::HttpTransport;
use crate::transport::GraphTransport;
use crate::verifier::PublicationVerifier;

pub struct GramcastService {
    config: Arc<Config>,
    queue: Arc<JobQueue>,
}

impl GramcastService {
    /// Build the service with the HTTP transport
    ///
    /// Must be called inside a Tokio runtime; the queue worker is spawned
    /// immediately.
    pub fn from_config(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(config.api_root(), config.graph.request_timeout)
            .map_err(|e| ConfigError::Invalid(format!("cannot build HTTP client: {}", e)))?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Build the service around any transport
    pub fn with_transport(config: Config, transport: Arc<dyn GraphTransport>) -> Result<Self> {
        config.validate()?;
        let access_token = config.access_token()?;
        let account_id = config.account_id()?.to_string();
        let shutdown = CancellationToken::new();

        let tracker = Arc::new(RateLimitTracker::new(&config.rate_limit));
        let retry = RetryPolicy::from_config(&config.retry, config.graph.request_timeout);
        let client = Arc::new(PublishClient::new(
            transport,
            access_token,
            account_id,
            tracker,
            retry,
            shutdown.clone(),
        ));

        let polling = &config.polling;
        let image_poller = ContainerStatusPoller::new(
            client.clone(),
            polling.delay,
            polling.max_attempts,
            polling.max_rate_limit_waits,
        );
        let reel_poller = ContainerStatusPoller::new(
            client.clone(),
            polling.delay,
            polling.reel_max_attempts,
            polling.max_rate_limit_waits,
        );
        let verifier = Arc::new(PublicationVerifier::new(client.clone(), config.verifier.clone()));
        let resolver = MediaResolver::from_config(&config);

        let publisher = Arc::new(MediaPublisher::new(
            client,
            image_poller,
            reel_poller,
            verifier,
            resolver.clone(),
            config.publishing.clone(),
        ));

        let queue = Arc::new(JobQueue::start(
            publisher,
            resolver,
            QueueOptions::from_config(&config),
            shutdown,
        ));

        debug!(api_root = %config.api_root(), "Service initialised");

        Ok(Self {
            config: Arc::new(config),
            queue,
        })
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.queue.subscribe()
    }

    /// Drain the queue and stop the worker
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }

    /// Cancel in-flight and queued work, then shut down
    pub async fn abort(&self) {
        self.queue.cancel();
        self.queue.shutdown().await;
    }
}
