//! Bounded retries for tracker transports
//!
//! The legacy trackers this tool reads from sit behind flaky frontends: the
//! CGI Bugzilla drops connections under load and recovers within seconds,
//! so source fetches carry a generous retry budget. Target writes are never
//! retried here; the reconciler is idempotent and a re-run picks up where
//! the failed item left off.

use crate::{BzJiraError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How a failed call should be followed up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Transient; try again after backoff
    Retry,
    /// Transient with a server-mandated delay (Retry-After)
    RetryAfter(Duration),
    /// Permanent; surface immediately
    NoRetry,
}

/// Classification hook consumed by [`with_retry`]; implemented on
/// [`BzJiraError`] in `error.rs`
pub trait RetryableError {
    fn retry_decision(&self) -> RetryDecision;
}

/// Retry budget for one logical source operation
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryConfig {
    /// Budget for source fetches. Nine attempts over roughly a minute,
    /// standing in for the blunt high-retry transport the migrations
    /// historically needed against the legacy frontends.
    pub fn for_source_fetch() -> Self {
        Self {
            max_retries: 8,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Doubling backoff with up to 25% additive jitter, capped
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped * (1.0 + jitter_fraction() * 0.25))
    }
}

/// Cheap 0.0..1.0 jitter from the clock; spreading retries is all it's for
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Run a source call, retrying transient failures within the budget.
/// `operation` names the call in the retry logs.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let wait = match err.retry_decision() {
            RetryDecision::NoRetry => {
                debug!(operation, "Failed with permanent error: {}", err);
                return Err(err);
            }
            RetryDecision::RetryAfter(d) if attempt < config.max_retries => {
                d.min(config.max_backoff)
            }
            RetryDecision::Retry if attempt < config.max_retries => config.backoff(attempt),
            _ => {
                warn!(
                    operation,
                    attempts = attempt + 1,
                    "Giving up after {} attempts: {}",
                    attempt + 1,
                    err
                );
                return Err(err);
            }
        };

        warn!(
            operation,
            attempt = attempt + 1,
            wait_secs = wait.as_secs_f64(),
            "Transient failure, retrying: {}",
            err
        );
        sleep(wait).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_retries: 8,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        };
        // Jitter adds at most 25%
        for (attempt, base) in [(0u32, 1.0f64), (1, 2.0), (2, 4.0), (10, 30.0)] {
            let backoff = config.backoff(attempt).as_secs_f64();
            assert!(backoff >= base, "attempt {}: {} < {}", attempt, backoff, base);
            assert!(backoff <= base * 1.25, "attempt {}: {} > {}", attempt, backoff, base * 1.25);
        }
    }

    #[tokio::test]
    async fn test_flaky_frontend_recovers_within_budget() {
        let mut calls = 0;
        let result = with_retry(&test_config(), "bugzilla_cgi_get", || {
            calls += 1;
            async move {
                if calls < 3 {
                    Err(BzJiraError::Source(
                        "Bugzilla request failed: HTTP 503: overloaded".to_string(),
                    ))
                } else {
                    Ok("bug xml")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "bug xml");
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_surfaces_the_error() {
        let mut calls = 0;
        let result: Result<()> = with_retry(&test_config(), "bugzilla_cgi_get", || {
            calls += 1;
            async move {
                Err(BzJiraError::Source(
                    "Bugzilla request failed: HTTP 502: bad gateway".to_string(),
                ))
            }
        })
        .await;

        assert!(matches!(result, Err(BzJiraError::Source(_))));
        assert_eq!(calls, 3); // initial + max_retries
    }

    #[tokio::test]
    async fn test_malformed_payload_is_not_retried() {
        let mut calls = 0;
        let result: Result<()> = with_retry(&test_config(), "bugzilla_cgi_get", || {
            calls += 1;
            async move { Err(BzJiraError::Parse("bug 42: no <bug> element".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(BzJiraError::Parse(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_delay_is_capped_by_the_budget() {
        // A huge Retry-After must not stall the run past max_backoff; with a
        // tiny cap the retry happens promptly and the call still recovers.
        let config = RetryConfig {
            max_retries: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        let mut calls = 0;
        let started = std::time::Instant::now();
        let result = with_retry(&config, "jira_search", || {
            calls += 1;
            async move {
                if calls == 1 {
                    Err(BzJiraError::RateLimited(3600))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls, 2);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
