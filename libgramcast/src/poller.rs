//! Container status polling
//!
//! A container starts in `CREATED` once the create call returns its id. The
//! poller checks its status every `delay` until the remote reports a
//! terminal code or `max_attempts` checks have been spent:
//!
//! ```text
//! CREATED ──poll──▶ IN_PROGRESS ──poll──▶ … ──▶ FINISHED | ERROR | EXPIRED
//!                                   └── attempts exhausted ──▶ TIMEOUT
//! ```
//!
//! A rate-limit response pauses for its `retry_after` without spending an
//! attempt. Transient failures that survive the client's own retries spend
//! an attempt and polling continues. Any other error ends polling.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::PublishClient;
use crate::error::PublishError;
use crate::types::ContainerState;

/// Final state of a polled container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    pub container_id: String,
    pub state: ContainerState,
    /// Status checks spent, excluding rate-limited ones
    pub attempts: u32,
    /// Free-text `status` from the last response, useful when the state is ERROR
    pub last_status: Option<String>,
}

impl PollOutcome {
    pub fn is_finished(&self) -> bool {
        self.state == ContainerState::Finished
    }
}

pub struct ContainerStatusPoller {
    client: Arc<PublishClient>,
    delay: Duration,
    max_attempts: u32,
    max_rate_limit_waits: u32,
}

impl ContainerStatusPoller {
    pub fn new(client: Arc<PublishClient>, delay: Duration, max_attempts: u32, max_rate_limit_waits: u32) -> Self {
        Self {
            client,
            delay,
            max_attempts: max_attempts.max(1),
            max_rate_limit_waits,
        }
    }

    /// Longest polling can take, excluding rate-limit pauses
    pub fn worst_case(&self) -> Duration {
        let sleeps = self.delay.saturating_mul(self.max_attempts.saturating_sub(1));
        let calls = self
            .client
            .retry_policy()
            .worst_case()
            .saturating_mul(self.max_attempts);
        sleeps + calls
    }

    /// Poll until the container reaches a terminal state
    ///
    /// # Errors
    ///
    /// Returns the client's error for anything other than a transient
    /// failure, and the rate-limit error itself once more than
    /// `max_rate_limit_waits` pauses were needed.
    pub async fn poll(&self, container_id: &str) -> Result<PollOutcome, PublishError> {
        let mut state = ContainerState::Created;
        let mut attempts = 0u32;
        let mut rate_limit_waits = 0u32;
        let mut last_status = None;

        debug!(container_id, max_attempts = self.max_attempts, "Polling container status");

        while attempts < self.max_attempts {
            match self.client.container_status(container_id).await {
                Ok(report) => {
                    attempts += 1;
                    let next = ContainerState::from_status_code(&report.status_code);
                    if next != state {
                        debug!(container_id, from = %state, to = %next, attempt = attempts, "Container state changed");
                    }
                    state = next;
                    last_status = report.status;

                    if state.is_terminal() {
                        info!(container_id, state = %state, attempts, "Container reached terminal state");
                        return Ok(PollOutcome {
                            container_id: container_id.to_string(),
                            state,
                            attempts,
                            last_status,
                        });
                    }
                }
                Err(PublishError::RateLimit { detail, retry_after }) => {
                    rate_limit_waits += 1;
                    if rate_limit_waits > self.max_rate_limit_waits {
                        warn!(container_id, rate_limit_waits, "Too many rate-limit pauses while polling");
                        return Err(PublishError::RateLimit { detail, retry_after });
                    }
                    warn!(
                        container_id,
                        wait_secs = retry_after.as_secs(),
                        "Rate limited while polling, pausing without spending an attempt"
                    );
                    self.client.sleep(retry_after).await?;
                    continue;
                }
                Err(e @ (PublishError::TemporaryServer(_) | PublishError::Transport(_))) => {
                    attempts += 1;
                    warn!(container_id, attempt = attempts, "Status check failed: {}", e);
                }
                Err(e) => return Err(e),
            }

            if attempts < self.max_attempts {
                self.client.sleep(self.delay).await?;
            }
        }

        warn!(
            container_id,
            attempts,
            last_state = %state,
            "Container did not reach a terminal state, giving up"
        );
        Ok(PollOutcome {
            container_id: container_id.to_string(),
            state: ContainerState::Timeout,
            attempts,
            last_status,
        })
    }
}
