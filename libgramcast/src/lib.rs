//! Gramcast - an asynchronous media publish pipeline
//!
//! Turns "post this media" requests into confirmed publications on a
//! platform that uses the container publishing protocol: create a
//! container, wait for the remote side to process it, publish it. Jobs
//! run one at a time through a single worker; remote calls are retried,
//! classified and rate-limit aware; ambiguous failures are reconciled
//! against the account's recent posts before a job is marked failed.

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod poller;
pub mod publisher;
pub mod queue;
pub mod rate_limiter;
pub mod service;
pub mod transport;
pub mod types;
pub mod verifier;

// Re-export commonly used types
pub use config::Config;
pub use error::{GramcastError, PublishError, Result};
pub use publisher::{JobProcessor, MediaPublisher, PublishOutcome};
pub use queue::events::{Event, EventBus};
pub use queue::{JobQueue, QueueOptions};
pub use service::GramcastService;
pub use types::{ContentType, Job, JobSpec, JobStatus, MediaRef, QueueStats, SubmitOptions};
