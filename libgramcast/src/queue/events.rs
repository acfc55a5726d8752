//! Queue event bus
//!
//! Job lifecycle events go out on a `tokio::sync::broadcast` channel. With
//! no subscribers an event is simply dropped, and a lagging subscriber
//! never blocks the worker; it misses the oldest events instead.
//!
//! # Example
//!
//! ```
//! use libgramcast::queue::events::{Event, EventBus};
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut receiver = bus.subscribe();
//!
//! bus.emit(Event::JobReset {
//!     job_id: "abc123".to_string(),
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("{}", event.job_id());
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{ContentType, JobError, JobId, JobResult, JobStatus};

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Job lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Accepted and waiting for the worker
    JobQueued {
        job_id: JobId,
        content_type: ContentType,
    },

    /// Picked up by the worker
    JobStarted {
        job_id: JobId,
        content_type: ContentType,
        /// Deterministic upper bound on processing, in seconds
        worst_case_secs: u64,
    },

    JobCompleted {
        job_id: JobId,
        result: JobResult,
        duration_secs: f64,
    },

    /// Ended in `failed`, `rate_limited` or `policy_violation`
    JobFailed {
        job_id: JobId,
        status: JobStatus,
        error: JobError,
    },

    /// Put back to pending by an operator
    JobReset { job_id: JobId },
}

impl Event {
    pub fn job_id(&self) -> &str {
        match self {
            Event::JobQueued { job_id, .. }
            | Event::JobStarted { job_id, .. }
            | Event::JobCompleted { job_id, .. }
            | Event::JobFailed { job_id, .. }
            | Event::JobReset { job_id } => job_id,
        }
    }

    /// Whether the job has reached a terminal status with this event
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::JobCompleted { .. } | Event::JobFailed { .. })
    }
}
