//! Bounded retry of command-side operations.
//!
//! The event log never retries internally. Callers that rebuild their
//! events from fresh state wrap the whole read-decide-push cycle in
//! [`retry_on_conflict`].

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

use crate::config::{env_millis, env_parse, ConfigError};
use crate::errors::{EventstoreError, EventstoreResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Randomise delays by ±20%.
    pub use_jitter: bool,
    /// Which errors are retried.
    pub policy: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            use_jitter: true,
            policy: RetryPolicy::default(),
        }
    }
}

impl RetryConfig {
    /// Reads `IDSTORE_RETRY_MAX_ATTEMPTS`, `IDSTORE_RETRY_BASE_DELAY_MS` and
    /// `IDSTORE_RETRY_MAX_DELAY_MS`, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_attempts: env_parse("IDSTORE_RETRY_MAX_ATTEMPTS")?
                .unwrap_or(defaults.max_attempts),
            base_delay: env_millis("IDSTORE_RETRY_BASE_DELAY_MS")?
                .unwrap_or(defaults.base_delay),
            max_delay: env_millis("IDSTORE_RETRY_MAX_DELAY_MS")?.unwrap_or(defaults.max_delay),
            ..defaults
        })
    }

    /// Delay before attempt `attempt` (0-based); zero for the first attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay_ms =
            self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        let capped = Duration::from_millis(delay_ms as u64).min(self.max_delay);
        if self.use_jitter {
            let factor = rand::rng().random_range(0.8..1.2);
            Duration::from_millis((capped.as_millis() as f64 * factor) as u64)
        } else {
            capped
        }
    }
}

/// Policy defining which errors should trigger a retry.
#[derive(Debug, Clone, Default)]
pub enum RetryPolicy {
    /// Only retry on concurrency conflicts.
    #[default]
    ConcurrencyConflictsOnly,
    /// Retry everything [`EventstoreError::is_retryable`] accepts.
    ConcurrencyAndTransient,
    /// Custom policy with user-defined predicate.
    Custom(fn(&EventstoreError) -> bool),
}

impl RetryPolicy {
    /// Determines if an error should trigger a retry.
    pub fn should_retry(&self, error: &EventstoreError) -> bool {
        match self {
            Self::ConcurrencyConflictsOnly => error.is_concurrency_conflict(),
            Self::ConcurrencyAndTransient => error.is_retryable(),
            Self::Custom(predicate) => predicate(error),
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `config.max_attempts` is reached. The closure receives the 0-based attempt.
pub async fn retry_on_conflict<F, Fut, T>(config: &RetryConfig, mut operation: F) -> EventstoreResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = EventstoreResult<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "[retry] succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) if attempt + 1 < max_attempts && config.policy.should_retry(&error) => {
                attempt += 1;
                let delay = config.delay_for(attempt);
                debug!(%error, attempt, ?delay, "[retry] retrying");
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                if config.policy.should_retry(&error) {
                    warn!(%error, attempts = attempt + 1, "[retry] attempts exhausted");
                }
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Operation;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> EventstoreError {
        EventstoreError::ConcurrencyConflict {
            code: "TEST-Conc1",
            aggregate: "i/user/1".to_string(),
            expected: None,
            current: None,
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            base_delay: Duration::from_millis(1),
            use_jitter: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn delays_grow_exponentially_and_are_capped() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            use_jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for(0), Duration::ZERO);
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let delay = config.delay_for(1);
            assert!(delay >= Duration::from_millis(80) && delay <= Duration::from_millis(120));
        }
    }

    #[test]
    fn default_policy_only_retries_conflicts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&conflict()));
        assert!(!policy.should_retry(&EventstoreError::internal(
            "TEST-Int01",
            Operation::Push,
            "io"
        )));
        assert!(RetryPolicy::ConcurrencyAndTransient.should_retry(&EventstoreError::internal(
            "TEST-Int01",
            Operation::Push,
            "io"
        )));
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(&fast(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(conflict())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: EventstoreResult<()> = retry_on_conflict(&fast(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(conflict()) }
        })
        .await;
        assert!(result.unwrap_err().is_concurrency_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(logs_contain("[retry] attempts exhausted"));
    }

    #[tokio::test]
    async fn already_exists_is_never_retried() {
        let calls = AtomicU32::new(0);
        let result: EventstoreResult<()> = retry_on_conflict(&fast(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(EventstoreError::AlreadyExists {
                    code: "TEST-Uniq1",
                    unique_type: "username".into(),
                    unique_field: "gigi".into(),
                    message: "taken".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
