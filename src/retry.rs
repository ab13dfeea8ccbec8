//! Exponential backoff with jitter.
//!
//! A [`RetryPolicy`] decides how long to wait before retry `n` and whether
//! retry `n` is allowed at all. The callback sender uses one per `send` call;
//! each receiver owns one as its restart policy.

use std::time::Duration;

use rand::Rng;

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries, `None` for unbounded
    pub max_retries: Option<u32>,
    /// Delay before the first retry, and the lower bound of every delay
    pub min_delay: Duration,
    /// Upper bound of every delay
    pub max_delay: Duration,
    /// Add up to 10% random jitter (still capped at `max_delay`)
    pub jitter: bool,
}

impl RetryPolicy {
    /// Four retries (five attempts in all) with backoff between 500ms and 3s.
    pub fn callback() -> Self {
        Self {
            max_retries: Some(4),
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            jitter: true,
        }
    }

    /// Unbounded restarts with a fixed delay.
    pub fn reconnect(delay: Duration) -> Self {
        Self {
            max_retries: None,
            min_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: Some(0),
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Sets the retry limit.
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether retry number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        match self.max_retries {
            Some(max) => attempt <= max,
            None => true,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let min_ms = self.min_delay.as_millis() as u64;
        let max_ms = (self.max_delay.as_millis() as u64).max(min_ms);

        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let capped = min_ms.saturating_mul(factor).min(max_ms);

        let jitter_range = capped / 10;
        let jitter = if self.jitter && jitter_range > 0 {
            rand::rng().random_range(0..jitter_range)
        } else {
            0
        };

        Duration::from_millis((capped + jitter).min(max_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::callback()
    }
}
