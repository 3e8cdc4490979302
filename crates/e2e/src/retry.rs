//! Bounded retry for probes against a freshly started host
//!
//! Hosts that just reported readiness still refuse or reset connections now
//! and then, notably on the lightweight runtime. The policy masks that so
//! validation only ever sees a real response.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult};

/// Classifies a probe failure as worth another attempt
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for reqwest::Error {
    fn is_transient(&self) -> bool {
        self.is_connect() || self.is_timeout() || self.is_request()
    }
}

/// Failure of a single HTTP probe
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The host answered but is still warming up
    #[error("service unavailable ({0})")]
    Unavailable(reqwest::StatusCode),
}

impl Transient for ProbeError {
    fn is_transient(&self) -> bool {
        match self {
            ProbeError::Http(e) => e.is_transient(),
            ProbeError::Unavailable(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Upper bound on probe invocations
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff: Backoff::Linear,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms;
        let ms = match self.backoff {
            Backoff::Linear => base.saturating_mul(attempt as u64),
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(32);
                base.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Run `probe` until it succeeds, fails permanently, runs out of
    /// attempts or `cancel` fires. Cancellation also aborts an in-flight
    /// probe and any pending backoff.
    pub async fn retry<F, Fut, T, E>(&self, mut probe: F, cancel: &CancellationToken) -> HarnessResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = String::from("no attempt made");

        while attempts < max_attempts {
            if cancel.is_cancelled() {
                return Err(cancelled(attempts));
            }

            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(attempts)),
                outcome = probe() => outcome,
            };

            match outcome {
                Ok(value) => {
                    if attempts > 1 {
                        debug!("Probe succeeded on attempt {}", attempts);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    last_error = e.to_string();
                    if attempts == max_attempts {
                        break;
                    }
                    let delay = self.delay_for(attempts);
                    warn!(
                        "Probe attempt {}/{} failed: {}; retrying in {:?}",
                        attempts, max_attempts, e, delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(cancelled(attempts)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    return Err(HarnessError::DeploymentUnreachable {
                        attempts,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(HarnessError::DeploymentUnreachable {
            attempts,
            reason: last_error,
        })
    }
}

fn cancelled(attempts: u32) -> HarnessError {
    HarnessError::DeploymentUnreachable {
        attempts,
        reason: "hosted process exited; retry cancelled".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[derive(Debug)]
    struct Flaky(bool);

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            backoff: Backoff::Linear,
        }
    }

    #[test]
    fn test_delay_schedule() {
        let linear = RetryPolicy::default();
        assert_eq!(linear.delay_for(1), Duration::from_secs(1));
        assert_eq!(linear.delay_for(3), Duration::from_secs(3));
        assert_eq!(linear.delay_for(50), Duration::from_secs(10));

        let exp = RetryPolicy {
            backoff: Backoff::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            ..Default::default()
        };
        assert_eq!(exp.delay_for(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for(3), Duration::from_millis(400));
        assert_eq!(exp.delay_for(60), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = fast(5)
            .retry(
                || {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(Flaky(true))
                        } else {
                            Ok(n)
                        }
                    }
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_never_exceeds_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = fast(4)
            .retry(
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(Flaky(true)) }
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            HarnessError::DeploymentUnreachable { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = fast(5)
            .retry(
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(Flaky(false)) }
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, HarnessError::DeploymentUnreachable { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = fast(5)
            .retry(
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, Flaky>(()) }
                },
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(err, HarnessError::DeploymentUnreachable { attempts: 0, .. }));
    }

    #[tokio::test]
    async fn test_cancel_aborts_backoff() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            backoff: Backoff::Linear,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = policy
            .retry(|| async { Err::<(), _>(Flaky(true)) }, &cancel)
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, HarnessError::DeploymentUnreachable { attempts: 1, .. }));
    }
}
