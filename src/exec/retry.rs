//! Retry wrapper for transient failures
//!
//! Wraps any async unit with an attempt-limited, backoff-governed loop.
//! Command-exit failures are not retried by default; connection and
//! timeout failures are.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::command::AdapterKind;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload};

/// Delay growth strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Constant `initial_delay` between attempts.
    Fixed,
    /// `initial_delay * attempt`.
    Linear,
    /// `initial_delay * factor^(attempt-1)`, capped at `max_delay`.
    #[default]
    Exponential,
}

/// Custom retry predicate: `(error, attempt) -> retry?`.
pub type ShouldRetry = Arc<dyn Fn(&Error, u32) -> bool + Send + Sync>;

/// Retry policy attached to a command.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Multiplier for exponential backoff.
    pub factor: f64,
    /// Timeout applied to each attempt individually.
    pub per_attempt_timeout: Option<Duration>,
    /// Overrides the transient-error default.
    pub should_retry: Option<ShouldRetry>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff", &self.backoff)
            .field("factor", &self.factor)
            .field("per_attempt_timeout", &self.per_attempt_timeout)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential,
            factor: 2.0,
            per_attempt_timeout: None,
            should_retry: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: delay,
            backoff: Backoff::Fixed,
            ..Default::default()
        }
    }

    /// Delay to sleep before attempt `attempt + 1` (1-based attempts).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Linear => self.initial_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = self.factor.max(1.0).powi(attempt.saturating_sub(1) as i32);
                self.initial_delay.mul_f64(factor)
            }
        };
        delay.min(self.max_delay)
    }

    fn retryable(&self, error: &Error, attempt: u32) -> bool {
        match &self.should_retry {
            Some(predicate) => predicate(error, attempt),
            None => error.is_transient(),
        }
    }
}

/// Run `op` under `policy`, emitting `retry:*` events on `bus`.
///
/// Intermediate failures are swallowed but still surface as
/// `retry:attempt` payloads; the last error is returned when every
/// attempt fails.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    bus: &EventBus,
    adapter: AdapterKind,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut last_delay = None;

    for attempt in 1..=max_attempts {
        bus.emit(
            adapter,
            EventPayload::RetryAttempt {
                attempt,
                max_attempts,
                delay: last_delay,
                error: None,
            },
        );

        let outcome = match policy.per_attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Timeout {
                    command: String::new(),
                    timeout: limit,
                    partial: None,
                }),
            },
            None => op().await,
        };

        match outcome {
            Ok(value) => {
                bus.emit(
                    adapter,
                    EventPayload::RetrySuccess {
                        attempt,
                        max_attempts,
                        total_duration: started.elapsed(),
                    },
                );
                return Ok(value);
            }
            Err(error) => {
                if attempt < max_attempts && policy.retryable(&error, attempt) {
                    let delay = policy.delay_for(attempt);
                    debug!(
                        attempt,
                        max_attempts,
                        ?delay,
                        %error,
                        "attempt failed, retrying"
                    );
                    bus.emit(
                        adapter,
                        EventPayload::RetryAttempt {
                            attempt,
                            max_attempts,
                            delay: Some(delay),
                            error: Some(error.to_string()),
                        },
                    );
                    last_delay = Some(delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }

                warn!(attempt, max_attempts, %error, "retries exhausted");
                bus.emit(
                    adapter,
                    EventPayload::RetryFailed {
                        attempt,
                        max_attempts,
                        total_duration: started.elapsed(),
                        last_error: error.to_string(),
                    },
                );
                return Err(error);
            }
        }
    }

    unreachable!("retry loop always returns from its last attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_caps_at_max_delay() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }

    #[test]
    fn test_linear_and_fixed_backoff() {
        let linear = RetryPolicy {
            backoff: Backoff::Linear,
            initial_delay: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(linear.delay_for(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(5, Duration::from_millis(250));
        assert_eq!(fixed.delay_for(1), Duration::from_millis(250));
        assert_eq!(fixed.delay_for(4), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::new(5)
        };
        let bus = EventBus::new();
        let calls = AtomicU32::new(0);

        let result = run_with_retry(&policy, &bus, AdapterKind::Local, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Connection {
                        host: "h".into(),
                        message: "reset".into(),
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_command_failure_not_retried() {
        let policy = RetryPolicy::new(5);
        let bus = EventBus::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = run_with_retry(&policy, &bus, AdapterKind::Local, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                let mut failed = crate::exec::ExecutionResult::new("false", AdapterKind::Local);
                failed.exit_code = 1;
                Err(Error::CommandFailed(Box::new(failed)))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate_overrides_default() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            should_retry: Some(Arc::new(|_, attempt| attempt < 2)),
            ..RetryPolicy::new(4)
        };
        let bus = EventBus::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = run_with_retry(&policy, &bus, AdapterKind::Local, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::Validation("always".into()))
            }
        })
        .await;

        assert!(result.is_err());
        // Attempt 1 retried by the predicate, attempt 2 refused.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_events_emitted() {
        use parking_lot::Mutex;

        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::new(3)
        };
        let bus = EventBus::new();
        let names = Arc::new(Mutex::new(Vec::new()));

        let names2 = names.clone();
        bus.subscribe("retry:*", move |event| {
            names2.lock().push(event.name().to_string());
        });

        let calls = AtomicU32::new(0);
        let _ = run_with_retry(&policy, &bus, AdapterKind::Local, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::Connection {
                        host: "h".into(),
                        message: "reset".into(),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        let seen = names.lock().clone();
        assert!(seen.contains(&"retry:success".to_string()));
        assert!(seen.iter().filter(|n| *n == "retry:attempt").count() >= 2);
    }
}
