//! Target issue store boundary
//!
//! The only component that mutates persistent state. The Reconciler talks to
//! the target exclusively through the [`TargetStore`] trait so tests can run
//! against an in-memory store instead of a live JIRA.

pub mod jira;

use crate::Result;
use async_trait::async_trait;

pub use jira::{JiraClient, JiraTarget};

/// Search hit: JIRA search results are summaries, not full issues. The
/// Reconciler re-fetches detail by key before mutating anything.
#[derive(Debug, Clone)]
pub struct IssueSummary {
    pub key: String,
    /// Custom field value when the search endpoint returned it
    pub external_ref: Option<String>,
}

/// Full detail of a target issue, enough for idempotent reconciliation
#[derive(Debug, Clone, Default)]
pub struct TargetIssue {
    pub key: String,
    /// Current workflow status name (`Open`, `Assigned`, `Resolved`, ...)
    pub status: String,
    /// Value of the external-id custom field
    pub external_ref: Option<String>,
    /// Filenames of attachments already present
    pub attachment_filenames: Vec<String>,
    /// Bodies of comments already present, in order
    pub comment_bodies: Vec<String>,
}

/// Fields for a new target issue. Issue type is always Bug (spec'd); the
/// custom field carries the disambiguated external ref.
#[derive(Debug, Clone)]
pub struct NewIssue {
    pub project_key: String,
    pub summary: String,
    pub description: String,
    pub priority: String,
    pub external_ref: String,
}

/// A workflow transition request, optionally carrying resolution metadata
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    /// Transition name as configured in the target workflow
    pub name: String,
    /// JIRA resolution name, required when reaching Resolved
    pub resolution: Option<String>,
    /// Explanatory comment posted with the transition
    pub comment: Option<String>,
    /// Extra field payload (fix-version / root-cause placeholders)
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Destination tracker operations used by the Reconciler
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Substring search on the external-id custom field, capped result size
    async fn search_by_external_ref(
        &self,
        project_key: &str,
        external_ref: &str,
    ) -> Result<Vec<IssueSummary>>;

    /// Revert-scan query: non-terminal issues in the project carrying any
    /// external ref, capped at `max` results
    async fn scan_linked_open_issues(
        &self,
        project_key: &str,
        max: u32,
    ) -> Result<Vec<IssueSummary>>;

    /// Fetch full issue detail by key
    async fn get_issue(&self, key: &str) -> Result<TargetIssue>;

    /// Create a Bug issue; returns the new detail (empty attachment and
    /// comment lists)
    async fn create_issue(&self, fields: &NewIssue) -> Result<TargetIssue>;

    /// Upload a named binary attachment
    async fn add_attachment(&self, key: &str, filename: &str, content: Vec<u8>) -> Result<()>;

    /// Append a text comment
    async fn add_comment(&self, key: &str, body: &str) -> Result<()>;

    /// Execute a named workflow transition
    async fn transition_issue(&self, key: &str, request: &TransitionRequest) -> Result<()>;

    /// Move an issue into the currently active sprint on a board
    async fn move_to_active_sprint(&self, board_id: u64, key: &str) -> Result<()>;
}
