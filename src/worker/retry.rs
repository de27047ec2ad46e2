//! Failure classification and retry policy
//!
//! Exceptions are classified into transient (retried with exponential
//! backoff), auth-shaped (longer cooldown, few attempts, then manual),
//! permanent (no retry) and cancelled. Delays carry +-25% jitter so a herd
//! of failed fetches does not retry in lockstep.

use std::fmt;
use std::time::Duration;

use crate::infrastructure::config::RetryConfig;
use crate::infrastructure::http_client::FetchError;

/// Failure classes driving the retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, server error, rate limit: retry with backoff
    Transient,
    /// Forbidden or captcha: long cooldown, then human-manual
    AuthBlocked,
    /// Malformed data, validation failure, not found: never retry
    Permanent,
    Cancelled,
}

/// A classified task failure
#[derive(Debug)]
pub struct TaskError {
    pub class: ErrorClass,
    /// Stable code recorded on work items and error digests
    pub code: String,
    pub message: String,
}

impl TaskError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn auth(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::AuthBlocked,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            class: ErrorClass::Cancelled,
            code: "Cancelled".to_string(),
            message: "task cancelled".to_string(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<FetchError> for TaskError {
    fn from(error: FetchError) -> Self {
        let code = error.code().to_string();
        let message = error.to_string();
        let class = match &error {
            FetchError::Timeout
            | FetchError::ConnectRefused
            | FetchError::TooManyRequests
            | FetchError::ServerError { .. }
            | FetchError::Network(_)
            | FetchError::NoIdentity(_) => ErrorClass::Transient,
            FetchError::Forbidden | FetchError::Captcha => ErrorClass::AuthBlocked,
            FetchError::NotFound | FetchError::Malformed(_) | FetchError::RobotsDisallowed { .. } => {
                ErrorClass::Permanent
            }
            FetchError::Cancelled => ErrorClass::Cancelled,
        };
        Self { class, code, message }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<TaskError>() {
            Ok(task_error) => task_error,
            // Store and queue hiccups are worth a retry
            Err(other) => Self::transient("Internal", format!("{other:#}")),
        }
    }
}

/// What the worker does with a failed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    /// No more attempts; `manual` marks failures needing operator action
    Terminal { manual: bool },
}

/// Per-task-class retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff delay for the given prior-attempt count:
    /// `base * factor^attempt`, capped, with +-jitter_frac randomization.
    pub fn backoff_delay(&self, attempt_no: u32) -> Duration {
        let exponential = self.config.base_delay_ms as f64 * self.config.backoff_factor.powi(attempt_no as i32);
        let capped = exponential.min(self.config.max_delay_ms as f64);

        let spread = capped * self.config.jitter_frac;
        let jittered = if spread > 0.0 {
            capped + fastrand::f64() * 2.0 * spread - spread
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Decide retry vs terminal for a failure with `attempt_no` prior
    /// attempts.
    pub fn decide(&self, class: ErrorClass, attempt_no: u32) -> RetryDecision {
        match class {
            ErrorClass::Transient => {
                if attempt_no >= self.config.max_attempts {
                    RetryDecision::Terminal { manual: false }
                } else {
                    RetryDecision::Retry(self.backoff_delay(attempt_no))
                }
            }
            ErrorClass::AuthBlocked => {
                if attempt_no >= self.config.auth_max_attempts {
                    RetryDecision::Terminal { manual: true }
                } else {
                    RetryDecision::Retry(Duration::from_millis(self.config.auth_cooldown_ms))
                }
            }
            ErrorClass::Permanent | ErrorClass::Cancelled => RetryDecision::Terminal { manual: false },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            base_delay_ms: 2000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            max_attempts: 5,
            jitter_frac: 0.25,
            auth_max_attempts: 2,
            auth_cooldown_ms: 300_000,
        })
    }

    #[test]
    fn backoff_doubles_within_jitter_bounds() {
        let policy = policy();
        // Expected centers: 2s, 4s, 8s, 16s, 32s with +-25% jitter
        for (attempt, center_ms) in [(0u32, 2000.0), (1, 4000.0), (2, 8000.0), (3, 16000.0), (4, 32000.0)] {
            for _ in 0..20 {
                let delay = policy.backoff_delay(attempt).as_millis() as f64;
                assert!(
                    delay >= center_ms * 0.75 - 1.0 && delay <= center_ms * 1.25 + 1.0,
                    "attempt {attempt}: delay {delay} outside {center_ms} +-25%"
                );
            }
        }
    }

    #[test]
    fn transient_exhausts_after_max_attempts() {
        let policy = policy();
        for attempt in 0..5 {
            assert!(matches!(policy.decide(ErrorClass::Transient, attempt), RetryDecision::Retry(_)));
        }
        assert_eq!(
            policy.decide(ErrorClass::Transient, 5),
            RetryDecision::Terminal { manual: false }
        );
    }

    #[test]
    fn auth_failures_go_manual_after_two() {
        let policy = policy();
        assert!(matches!(policy.decide(ErrorClass::AuthBlocked, 0), RetryDecision::Retry(_)));
        assert!(matches!(policy.decide(ErrorClass::AuthBlocked, 1), RetryDecision::Retry(_)));
        assert_eq!(
            policy.decide(ErrorClass::AuthBlocked, 2),
            RetryDecision::Terminal { manual: true }
        );
    }

    #[test]
    fn permanent_and_cancelled_never_retry() {
        let policy = policy();
        assert!(matches!(
            policy.decide(ErrorClass::Permanent, 0),
            RetryDecision::Terminal { .. }
        ));
        assert!(matches!(
            policy.decide(ErrorClass::Cancelled, 0),
            RetryDecision::Terminal { .. }
        ));
    }

    #[test]
    fn fetch_error_classification() {
        assert_eq!(TaskError::from(FetchError::Timeout).class, ErrorClass::Transient);
        assert_eq!(TaskError::from(FetchError::TooManyRequests).class, ErrorClass::Transient);
        assert_eq!(TaskError::from(FetchError::Captcha).class, ErrorClass::AuthBlocked);
        assert_eq!(TaskError::from(FetchError::Forbidden).class, ErrorClass::AuthBlocked);
        assert_eq!(TaskError::from(FetchError::NotFound).class, ErrorClass::Permanent);
        assert_eq!(
            TaskError::from(FetchError::Malformed("bad".to_string())).class,
            ErrorClass::Permanent
        );
    }
}
