//! Retry Backoff
//!
//! Exponential backoff shared by the engine's reconnect and operating
//! loops. The first attempt runs immediately; every retry after that
//! waits twice as long as the previous one, up to the ceiling.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Default floor for the outer (reconnect) loop
pub const OUTER_FLOOR: Duration = Duration::from_millis(10);

/// Default ceiling for the outer (reconnect) loop
pub const OUTER_CEILING: Duration = Duration::from_secs(3);

/// Default floor for the inner (operating) loop
pub const INNER_FLOOR: Duration = Duration::from_millis(10);

/// Default ceiling for the inner (operating) loop
pub const INNER_CEILING: Duration = Duration::from_secs(1);

/// Backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub floor: Duration,
    /// Largest delay between retries
    pub ceiling: Duration,
    /// Randomize each delay between half and all of its nominal value
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Create a policy without jitter
    pub const fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            jitter: false,
        }
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Default policy for the reconnect loop
    pub const fn outer() -> Self {
        Self::new(OUTER_FLOOR, OUTER_CEILING)
    }

    /// Default policy for the operating loop
    pub const fn inner() -> Self {
        Self::new(INNER_FLOOR, INNER_CEILING)
    }

    /// Begin a retry sequence
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: None,
        }
    }
}

/// A running retry sequence
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Option<Duration>,
}

impl Backoff {
    /// Wait for the next attempt. Returns false once `token` is cancelled.
    pub async fn wait(&mut self, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }

        if let Some(delay) = self.next_delay() {
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        !token.is_cancelled()
    }

    /// Start over from an immediate attempt
    pub fn reset(&mut self) {
        self.current = None;
    }

    fn next_delay(&mut self) -> Option<Duration> {
        let Some(current) = self.current else {
            self.current = Some(self.policy.floor.min(self.policy.ceiling));
            return None;
        };

        self.current = Some((current * 2).min(self.policy.ceiling));

        if self.policy.jitter && !current.is_zero() {
            let nanos = current.as_nanos() as u64;
            let jittered = rand::thread_rng().gen_range(nanos / 2..=nanos);
            return Some(Duration::from_nanos(jittered));
        }
        Some(current)
    }
}
