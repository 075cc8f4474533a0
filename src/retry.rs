use std::time::Duration;

use crate::error::Error;

const DEFAULT_MAX_ATTEMPTS: usize = 2;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Whether another attempt is allowed after `attempt` failed attempts.
///
/// Terminal-class rejections (4xx other than 408 and 429) are never retried.
/// Every other failure is retried while `attempt < max_attempts`.
pub fn should_retry(attempt: usize, max_attempts: usize, error: &Error) -> bool {
    attempt < max_attempts && error.severity().is_retryable()
}

/// `base_delay * 2^attempt`, saturating at [`Duration::MAX`] only when the
/// product does not fit.
pub fn backoff_delay(base_delay: Duration, attempt: usize) -> Duration {
    if base_delay.is_zero() {
        return Duration::ZERO;
    }
    let nanos = u32::try_from(attempt)
        .ok()
        .and_then(|exponent| 1_u128.checked_shl(exponent))
        .and_then(|multiplier| base_delay.as_nanos().checked_mul(multiplier));
    let Some(nanos) = nanos else {
        return Duration::MAX;
    };
    match u64::try_from(nanos / NANOS_PER_SEC) {
        Ok(secs) => Duration::new(secs, (nanos % NANOS_PER_SEC) as u32),
        Err(_) => Duration::MAX,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl RetryPolicy {
    /// One retry after a one second pause.
    pub const fn standard() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: None,
        }
    }

    pub const fn disabled() -> Self {
        Self {
            max_attempts: 1,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: None,
        }
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Caps every backoff delay. Unset by default.
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn configured_base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn configured_max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    pub fn should_retry(&self, attempt: usize, error: &Error) -> bool {
        should_retry(attempt, self.max_attempts, error)
    }

    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let delay = backoff_delay(self.base_delay, attempt);
        match self.max_delay {
            Some(max_delay) => delay.min(max_delay),
            None => delay,
        }
    }

    pub(crate) fn with_overrides(
        &self,
        max_attempts: Option<usize>,
        base_delay: Option<Duration>,
    ) -> Self {
        let mut policy = self.clone();
        if let Some(max_attempts) = max_attempts {
            policy = policy.max_attempts(max_attempts);
        }
        if let Some(base_delay) = base_delay {
            policy = policy.base_delay(base_delay);
        }
        policy
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Attempt bookkeeping of one logical call. Never shared across calls.
#[derive(Debug, Default)]
pub(crate) struct RetryState {
    attempt: usize,
    last_error: Option<Error>,
}

impl RetryState {
    /// Zero-based index of the attempt about to run, or the number of
    /// attempts that already failed.
    pub(crate) fn attempt(&self) -> usize {
        self.attempt
    }

    pub(crate) fn record_failure(&mut self, error: Error) {
        self.attempt += 1;
        self.last_error = Some(error);
    }

    pub(crate) fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }
}
