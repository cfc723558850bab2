//! Retry policy: backoff computation and retry eligibility.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the jitter term of a backoff is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// Fixed at half of `jitter_fraction * backoff`. Identical failures get
    /// identical delays.
    #[default]
    Deterministic,
    /// Uniform draw from `[0, jitter_fraction * backoff]`.
    Random,
}

/// Retry policy for failing tasks.
///
/// `attempt` arguments count failed executions: the first failure is attempt 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Number of failed attempts after which a task is dead-lettered.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any computed delay, jitter included.
    pub max_backoff: Duration,
    /// Growth factor per attempt (expected to be >= 1.0).
    pub backoff_multiplier: f64,
    /// Jitter as a fraction of the backoff (0.0 - 1.0).
    pub jitter_fraction: f64,
    pub jitter_mode: JitterMode,
    /// When non-empty, only errors containing one of these substrings retry.
    pub retryable_errors: Vec<String>,
    /// Errors containing any of these substrings never retry. Checked first.
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
            jitter_mode: JitterMode::Deterministic,
            retryable_errors: Vec::new(),
            non_retryable_errors: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Dead-letter on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, fraction: f64, mode: JitterMode) -> Self {
        self.jitter_fraction = fraction;
        self.jitter_mode = mode;
        self
    }

    /// Add a substring to the retry allow-list.
    pub fn retry_on(mut self, pattern: impl Into<String>) -> Self {
        self.retryable_errors.push(pattern.into());
        self
    }

    /// Add a substring to the retry deny-list.
    pub fn never_retry_on(mut self, pattern: impl Into<String>) -> Self {
        self.non_retryable_errors.push(pattern.into());
        self
    }

    /// Delay to wait before re-running a task that has failed `attempt` times.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let initial_ms = self.initial_backoff.as_millis() as f64;
        let max_ms = self.max_backoff.as_millis() as f64;

        // Exponent is capped: anything past 2^63 is already above every sane max.
        let exp = self.backoff_multiplier.powi((attempt - 1).min(63) as i32);
        let mut backoff_ms = initial_ms * exp;
        if !backoff_ms.is_finite() || backoff_ms > max_ms {
            backoff_ms = max_ms;
        }

        let fraction = self.jitter_fraction.clamp(0.0, 1.0);
        let jitter_ms = match self.jitter_mode {
            JitterMode::Deterministic => 0.5 * fraction * backoff_ms,
            JitterMode::Random if fraction > 0.0 => {
                rand::thread_rng().gen_range(0.0..=fraction * backoff_ms)
            }
            JitterMode::Random => 0.0,
        };

        let total_ms = (backoff_ms + jitter_ms).min(max_ms).max(0.0);
        Duration::from_millis(total_ms.round() as u64)
    }

    /// Whether a task that has failed `attempt` times with `error` gets another run.
    pub fn should_retry(&self, attempt: u32, error: &str) -> bool {
        if attempt >= self.max_retries {
            return false;
        }

        if self
            .non_retryable_errors
            .iter()
            .any(|pattern| error.contains(pattern.as_str()))
        {
            return false;
        }

        if !self.retryable_errors.is_empty() {
            return self
                .retryable_errors
                .iter()
                .any(|pattern| error.contains(pattern.as_str()));
        }

        true
    }
}
