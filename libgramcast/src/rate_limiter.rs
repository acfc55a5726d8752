//! Per-endpoint rate limit tracking
//!
//! Every remote call consults [`RateLimitTracker::should_backoff`] first. A
//! failed call extends the endpoint's error streak and pushes its cooldown
//! out exponentially; a successful call clears it.
//!
//! Methods ending in `_at` take the current instant explicitly so the
//! streak and reset rules can be tested without waiting.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Hard ceiling on any computed cooldown
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Jitter spread as a fraction of the delay (±10%)
const JITTER_FRACTION: f64 = 0.10;

/// Cap on the exponent so the multiplier cannot overflow
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// `min(max, base * 2^(n-1))` for the n-th consecutive failure
pub fn exponential_delay(base: Duration, max: Duration, n: u32) -> Duration {
    let exponent = n.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    let multiplier = 2_u32.saturating_pow(exponent);
    base.saturating_mul(multiplier).min(max)
}

/// Apply uniform ±10% jitter
pub fn apply_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }

    let millis = delay.as_millis() as f64;
    let spread = millis * JITTER_FRACTION;
    let jitter = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_millis((millis + jitter).max(0.0) as u64)
}

/// Bookkeeping for one endpoint
#[derive(Debug, Clone, Default)]
pub struct RateLimitWindow {
    pub error_count: u32,
    pub last_error_time: Option<Instant>,
    pub backoff_until: Option<Instant>,
    last_delay: Duration,
}

impl RateLimitWindow {
    fn reset(&mut self) {
        *self = RateLimitWindow::default();
    }
}

pub struct RateLimitTracker {
    base_delay: Duration,
    max_delay: Duration,
    reset_after: Duration,
    windows: Mutex<HashMap<String, Arc<Mutex<RateLimitWindow>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock leaves plain counters behind, still usable.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RateLimitTracker {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay.min(MAX_BACKOFF),
            reset_after: config.reset_after,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn window(&self, endpoint: &str) -> Arc<Mutex<RateLimitWindow>> {
        let mut windows = lock(&self.windows);
        windows
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RateLimitWindow::default())))
            .clone()
    }

    /// Whether calls to `endpoint` must wait, and for how long
    pub fn should_backoff(&self, endpoint: &str) -> (bool, Duration) {
        self.should_backoff_at(endpoint, Instant::now())
    }

    pub fn should_backoff_at(&self, endpoint: &str, now: Instant) -> (bool, Duration) {
        let window = self.window(endpoint);
        let mut window = lock(&window);

        if let Some(last_error) = window.last_error_time {
            if now.saturating_duration_since(last_error) >= self.reset_after {
                debug!(endpoint, "Error streak expired, resetting window");
                window.reset();
                return (false, Duration::ZERO);
            }
        }

        match window.backoff_until {
            Some(until) if until > now => (true, until - now),
            _ => (false, Duration::ZERO),
        }
    }

    /// Record a failed call and return the new cooldown
    pub fn record_error(&self, endpoint: &str) -> Duration {
        self.record_error_at(endpoint, Instant::now())
    }

    pub fn record_error_at(&self, endpoint: &str, now: Instant) -> Duration {
        let window = self.window(endpoint);
        let mut window = lock(&window);
        self.record_error_locked(&mut window, endpoint, now)
    }

    /// Extend the streak of an already locked window
    fn record_error_locked(&self, window: &mut RateLimitWindow, endpoint: &str, now: Instant) -> Duration {
        if let Some(last_error) = window.last_error_time {
            if now.saturating_duration_since(last_error) >= self.reset_after {
                window.reset();
            }
        }

        window.error_count = window.error_count.saturating_add(1);
        window.last_error_time = Some(now);

        let base = exponential_delay(self.base_delay, self.max_delay, window.error_count);
        // Jitter must not pull the delay below the previous one in the same streak.
        let delay = apply_jitter(base)
            .max(window.last_delay)
            .min(MAX_BACKOFF);
        window.last_delay = delay;
        window.backoff_until = Some(now + delay);

        if window.error_count > 1 {
            warn!(
                endpoint,
                streak = window.error_count,
                delay_ms = delay.as_millis() as u64,
                "Repeated errors on endpoint, backing off"
            );
        }

        delay
    }

    /// Record a rate-limit response that names its own wait
    ///
    /// The cooldown is at least `retry_after` (capped at one hour) and never
    /// shorter than what the streak already demands. The server's wait only
    /// moves `backoff_until`; later errors in the streak still follow the
    /// exponential schedule.
    pub fn record_rate_limit(&self, endpoint: &str, retry_after: Duration) -> Duration {
        self.record_rate_limit_at(endpoint, retry_after, Instant::now())
    }

    pub fn record_rate_limit_at(&self, endpoint: &str, retry_after: Duration, now: Instant) -> Duration {
        let window = self.window(endpoint);
        let mut window = lock(&window);

        let streak_delay = self.record_error_locked(&mut window, endpoint, now);
        let delay = streak_delay.max(retry_after.min(MAX_BACKOFF));
        window.backoff_until = Some(now + delay);
        delay
    }

    /// Record a successful call, clearing the endpoint's streak
    pub fn record_success(&self, endpoint: &str) {
        let window = self.window(endpoint);
        let mut window = lock(&window);
        if window.error_count > 0 {
            debug!(endpoint, "Call succeeded, clearing error streak");
        }
        window.reset();
    }

    /// Snapshot of an endpoint's window
    pub fn window_snapshot(&self, endpoint: &str) -> RateLimitWindow {
        lock(&self.window(endpoint)).clone()
    }
}
