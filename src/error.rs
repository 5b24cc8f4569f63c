//! Error types for bzjira
//!
//! Defines one error enum covering all failure modes across the system.
//! Uses thiserror for ergonomic error handling.
//!
//! Per-item failures (a single source issue that cannot be migrated) are
//! caught at the reconcile-one-issue boundary in the driver; only adapter
//! construction and authentication failures abort a whole run.

use thiserror::Error;

/// Result type alias for bzjira operations
pub type Result<T> = std::result::Result<T, BzJiraError>;

/// Comprehensive error type for bzjira operations
#[derive(Error, Debug)]
pub enum BzJiraError {
    /// Configuration errors (bad URLs, missing project key, misconfigured custom field)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication errors (login rejected, expired token)
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Source issue absent from its tracker. Recoverable: the caller skips
    /// and continues, since legacy/new-system id spaces legitimately overlap.
    #[error("Issue not found: {0}")]
    IssueNotFound(String),

    /// The substring custom-field search matched an issue whose stored
    /// external ref is not exactly ours. Prevented by construction via the
    /// id prefix; if it still happens, the field is misconfigured.
    #[error("Ambiguous match for external ref {external_ref}: matched {jira_key} carrying {stored:?}")]
    AmbiguousMatch {
        external_ref: String,
        jira_key: String,
        stored: Option<String>,
    },

    /// Source resolution with no entry in the JIRA resolution table.
    /// Fatal for the item; never silently guessed.
    #[error("Unmapped source resolution: {0}")]
    UnmappedResolution(String),

    /// Source status outside the known open/terminal sets for its tracker
    #[error("Unmapped source status: {0}")]
    UnmappedStatus(String),

    /// Parsing errors (Bugzilla XML, RSS, SOAP, JSON payload shape)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Source tracker API errors (Bugzilla/Mantis/source JIRA)
    #[error("Source error: {0}")]
    Source(String),

    /// Target JIRA API errors
    #[error("JIRA error: {0}")]
    Jira(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Rate limited (with retry-after duration in seconds)
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl crate::retry::RetryableError for BzJiraError {
    fn retry_decision(&self) -> crate::retry::RetryDecision {
        use crate::retry::RetryDecision;
        use std::time::Duration;

        match self {
            // Retryable errors
            BzJiraError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    RetryDecision::Retry
                } else if e.is_status() {
                    if let Some(status) = e.status() {
                        match status.as_u16() {
                            429 => RetryDecision::RetryAfter(Duration::from_secs(60)),
                            500..=599 => RetryDecision::Retry,
                            _ => RetryDecision::NoRetry,
                        }
                    } else {
                        RetryDecision::NoRetry
                    }
                } else {
                    RetryDecision::Retry
                }
            }
            BzJiraError::RateLimited(secs) => {
                RetryDecision::RetryAfter(Duration::from_secs(*secs))
            }
            // 5xx from a tracker surfaces as Source/Jira with the status in
            // the message; connection-level failures already map to Http.
            BzJiraError::Source(msg) | BzJiraError::Jira(msg) => {
                if msg.contains("HTTP 5") || msg.contains("timeout") {
                    RetryDecision::Retry
                } else {
                    RetryDecision::NoRetry
                }
            }
            // Non-retryable errors
            BzJiraError::Config(_)
            | BzJiraError::Auth(_)
            | BzJiraError::IssueNotFound(_)
            | BzJiraError::AmbiguousMatch { .. }
            | BzJiraError::UnmappedResolution(_)
            | BzJiraError::UnmappedStatus(_)
            | BzJiraError::Parse(_)
            | BzJiraError::Io(_)
            | BzJiraError::Json(_)
            | BzJiraError::Other(_) => RetryDecision::NoRetry,
        }
    }
}

impl BzJiraError {
    /// Whether this error should skip the current item instead of aborting
    /// the batch
    pub fn is_not_found(&self) -> bool {
        matches!(self, BzJiraError::IssueNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{RetryDecision, RetryableError};

    #[test]
    fn test_unmapped_resolution_is_not_retryable() {
        let e = BzJiraError::UnmappedResolution("MAYBE_LATER".to_string());
        assert_eq!(e.retry_decision(), RetryDecision::NoRetry);
    }

    #[test]
    fn test_rate_limited_retries_after() {
        let e = BzJiraError::RateLimited(30);
        assert_eq!(
            e.retry_decision(),
            RetryDecision::RetryAfter(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn test_server_error_message_is_retryable() {
        let e = BzJiraError::Jira("JIRA API error: HTTP 503: down".to_string());
        assert_eq!(e.retry_decision(), RetryDecision::Retry);
        let e = BzJiraError::Jira("JIRA API error: HTTP 400: bad field".to_string());
        assert_eq!(e.retry_decision(), RetryDecision::NoRetry);
    }

    #[test]
    fn test_not_found_detection() {
        assert!(BzJiraError::IssueNotFound("42".to_string()).is_not_found());
        assert!(!BzJiraError::Config("x".to_string()).is_not_found());
    }
}
