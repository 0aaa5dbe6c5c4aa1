//! Configuration for the branch-side engine.

use std::time::Duration;

/// Configuration for a branch's sync orchestrator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Branch identifier (the `sucursal`).
    pub branch_id: String,
    /// Authority base URL.
    pub server_url: String,
    /// Bearer token presented to the authority, if any.
    pub auth_token: Option<String>,
    /// Maximum records per push request.
    pub push_batch_size: usize,
    /// Maximum retries before a pending change is permanently failed.
    pub max_retries: u32,
    /// Conflicts processed per resolver batch.
    pub resolver_batch_size: usize,
    /// Pause between resolver batches.
    pub resolver_pause: Duration,
    /// Network request timeout.
    pub timeout: Duration,
    /// Interval for scheduled background syncs.
    pub sync_interval: Option<Duration>,
    /// Deadline for the best-effort push attempted at shutdown.
    pub shutdown_push_deadline: Duration,
    /// Retry behaviour for whole sessions.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration for a branch.
    pub fn new(branch_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            server_url: server_url.into(),
            auth_token: None,
            push_batch_size: 100,
            max_retries: 3,
            resolver_batch_size: 20,
            resolver_pause: Duration::from_millis(25),
            timeout: Duration::from_secs(30),
            sync_interval: None,
            shutdown_push_deadline: Duration::from_secs(3),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the bearer token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size;
        self
    }

    /// Sets the pending-change retry cap.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the resolver batch size.
    pub fn with_resolver_batch_size(mut self, size: usize) -> Self {
        self.resolver_batch_size = size;
        self
    }

    /// Sets the resolver inter-batch pause.
    pub fn with_resolver_pause(mut self, pause: Duration) -> Self {
        self.resolver_pause = pause;
        self
    }

    /// Sets the network timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the scheduled sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets the shutdown push deadline.
    pub fn with_shutdown_push_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_push_deadline = deadline;
        self
    }

    /// Sets the session retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Configuration for retry behaviour.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per session.
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter.
            let jitter = delay_secs * 0.25 * time_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Simple deterministic jitter source (no external RNG dependency).
fn time_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
