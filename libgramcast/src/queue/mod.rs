//! Job queue with a single background worker
//!
//! `submit` validates and enqueues synchronously; the worker picks jobs up
//! strictly one at a time in submission order. The job table, history and
//! statistics sit behind one mutex that is never held across an await, and
//! every read hands out a copy.
//!
//! # Example
//!
//! ```no_run
//! use libgramcast::service::GramcastService;
//! use libgramcast::types::{MediaRef, SubmitOptions};
//! use libgramcast::Config;
//!
//! # async fn example() -> libgramcast::Result<()> {
//! let service = GramcastService::from_config(Config::load()?)?;
//! let job_id = service.queue().submit(
//!     vec![MediaRef::new("https://cdn.example.com/photo.jpg")],
//!     "hello".to_string(),
//!     SubmitOptions::default(),
//! )?;
//! println!("{}", service.queue().get_status(&job_id)?.status);
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod events;
mod stats;
mod table;
mod worker;

pub use worker::find_blocked_term;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::events::{Event, EventBus, EventReceiver};
use self::table::JobTable;
use self::worker::Worker;
use crate::config::Config;
use crate::error::{GramcastError, Result};
use crate::media::MediaResolver;
use crate::publisher::JobProcessor;
use crate::types::{Job, JobId, JobSpec, MediaRef, QueueStats, SubmitOptions};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Queue tuning, usually taken from [`Config`]
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_history: usize,
    pub retention: Duration,
    pub event_capacity: usize,
    pub shutdown_timeout: Duration,
    pub blocked_terms: Vec<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl QueueOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_history: config.queue.max_history,
            retention: config.queue.retention,
            event_capacity: config.queue.event_capacity,
            shutdown_timeout: config.queue.shutdown_timeout,
            blocked_terms: config.publishing.blocked_terms.clone(),
        }
    }
}

pub struct JobQueue {
    table: Arc<Mutex<JobTable>>,
    sender: Mutex<Option<mpsc::UnboundedSender<JobId>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    events: EventBus,
    processor: Arc<dyn JobProcessor>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl JobQueue {
    /// Create the queue and spawn its worker on the current runtime
    pub fn start(
        processor: Arc<dyn JobProcessor>,
        resolver: MediaResolver,
        options: QueueOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let table = Arc::new(Mutex::new(JobTable::new(options.max_history)));
        let events = EventBus::new(options.event_capacity);
        let (sender, receiver) = mpsc::unbounded_channel();

        let worker = Worker {
            table: table.clone(),
            events: events.clone(),
            processor: processor.clone(),
            resolver,
            blocked_terms: options.blocked_terms,
            retention: options.retention,
            shutdown: shutdown.clone(),
            receiver,
        };
        let handle = tokio::spawn(worker.run());

        Self {
            table,
            sender: Mutex::new(Some(sender)),
            worker: tokio::sync::Mutex::new(Some(handle)),
            events,
            processor,
            shutdown,
            shutdown_timeout: options.shutdown_timeout,
        }
    }

    /// Accept a job and return its id
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the media list does not fit the content type
    /// - `NotFound` if a local media file does not exist
    /// - `QueueClosed` after shutdown has begun
    pub fn submit(&self, media: Vec<MediaRef>, caption: String, options: SubmitOptions) -> Result<JobId> {
        if self.is_closed() {
            return Err(GramcastError::QueueClosed);
        }

        let spec = JobSpec::build(media, caption, &options)?;
        for media in spec.media_refs() {
            MediaResolver::ensure_exists(media)?;
        }

        let job = Job::new(spec);
        let job_id = job.id.clone();
        let content_type = job.content_type();
        lock(&self.table).insert(job);

        if let Err(e) = self.enqueue(&job_id) {
            lock(&self.table).remove(&job_id);
            return Err(e);
        }

        info!(job_id = %job_id, content_type = %content_type, "Job queued");
        self.events.emit(Event::JobQueued {
            job_id: job_id.clone(),
            content_type,
        });
        Ok(job_id)
    }

    fn enqueue(&self, job_id: &str) -> Result<()> {
        lock(&self.sender)
            .as_ref()
            .ok_or(GramcastError::QueueClosed)?
            .send(job_id.to_string())
            .map_err(|_| GramcastError::QueueClosed)
    }

    /// Snapshot of one job
    pub fn get_status(&self, job_id: &str) -> Result<Job> {
        lock(&self.table)
            .get(job_id)
            .ok_or_else(|| GramcastError::NotFound(format!("job {}", job_id)))
    }

    pub fn get_stats(&self) -> QueueStats {
        lock(&self.table).stats()
    }

    /// Terminal jobs, most recently updated first
    pub fn get_history(&self, limit: usize) -> Vec<Job> {
        lock(&self.table).history(limit)
    }

    /// Put a failed, rate-limited or policy-blocked job back in the queue
    ///
    /// The job goes to the tail, behind anything already waiting.
    pub fn reset_to_pending(&self, job_id: &str) -> Result<Job> {
        if self.is_closed() {
            return Err(GramcastError::QueueClosed);
        }

        let job = lock(&self.table).reset(job_id)?;
        self.enqueue(job_id)?;

        info!(job_id, "Job reset to pending");
        self.events.emit(Event::JobReset {
            job_id: job_id.to_string(),
        });
        Ok(job)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn worst_case_duration(&self, spec: &JobSpec) -> Duration {
        self.processor.worst_case_duration(spec)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.sender).is_none()
    }

    /// Stop accepting work and wait for the worker to drain
    ///
    /// Jobs already queued keep running for up to the shutdown timeout.
    /// After that the cancellation token fires: an in-flight job fails
    /// with `Cancelled` at its next wait, and so does everything still
    /// queued behind it.
    pub async fn shutdown(&self) {
        let sender = lock(&self.sender).take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        info!("Queue closed, draining pending jobs");

        let handle = self.worker.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(_) => info!("Queue drained"),
                Err(_) => {
                    warn!(
                        timeout_secs = self.shutdown_timeout.as_secs(),
                        "Queue did not drain in time, cancelling remaining work"
                    );
                    self.shutdown.cancel();
                    if let Err(e) = handle.await {
                        warn!("Queue worker ended abnormally: {}", e);
                    }
                }
            }
        }
        self.shutdown.cancel();
    }

    /// Fire the cancellation token without waiting for a drain
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }
}
