use std::time::Duration;

use crate::queue::OverflowPolicy;

/// Sizing and overflow behavior of the outbound telemetry queue.
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    /// Maximum number of messages buffered while the link is down or busy.
    pub capacity: usize,
    /// What to do with a new message when the queue is at capacity.
    pub policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            policy: OverflowPolicy::Reject,
        }
    }
}

/// Shared retry timing for reconnection and acknowledgement retries.
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    /// Delay before the second attempt. Doubles on each further failure.
    pub base: Duration,
    /// Ceiling for the doubling delay, before jitter.
    pub max: Duration,
    /// Upper bound of the uniform random jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_jitter: Duration::from_millis(500),
        }
    }
}

/// Tunables for a device session.
#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Time limit for a single dial of the transport.
    pub connect_timeout: Duration,
    /// Time limit for writing a single frame to an established link.
    pub send_timeout: Duration,
    pub queue: QueueConfig,
    pub backoff: BackoffConfig,
    /// Consecutive failed reconnection attempts before the session gives up
    /// and returns to disconnected. `None` retries forever; zero disables
    /// reconnection.
    pub max_reconnect_attempts: Option<u32>,
    /// Failed sends of a single acknowledgement before it is reported lost.
    pub ack_max_attempts: u32,
    /// Number of recent message ids remembered for duplicate suppression.
    /// Zero disables deduplication.
    pub dedup_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            queue: QueueConfig::default(),
            backoff: BackoffConfig::default(),
            max_reconnect_attempts: Some(10),
            ack_max_attempts: 3,
            dedup_window: 128,
        }
    }
}

impl SessionConfig {
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: impl Into<Option<u32>>) -> Self {
        self.max_reconnect_attempts = attempts.into();
        self
    }
}
