//! Source tracker adapters
//!
//! One adapter per source kind, all normalizing into [`SourceIssue`] so the
//! Reconciler never sees tracker-specific shapes. Network I/O only; nothing
//! is cached between runs.

pub mod bugzilla_cgi;
pub mod bugzilla_rest;
pub mod jira;
pub mod mantis;
mod xml;

use crate::model::{SourceIssue, SourceKind};
use crate::Result;
use async_trait::async_trait;
use tracing::info;

pub use bugzilla_cgi::CgiBugzilla;
pub use bugzilla_rest::RestBugzilla;
pub use jira::JiraSource;
pub use mantis::MantisClient;

/// A bug tracker issues are migrated out of
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Fetch one issue by id. `IssueNotFound` is recoverable: legacy and
    /// new-system id spaces overlap, so the caller skips and continues.
    async fn fetch_issue(&self, id: &str) -> Result<SourceIssue>;

    /// Resolve a query/filter into a finite list of issue ids
    async fn fetch_issue_list(&self, query: &str) -> Result<Vec<String>>;
}

/// Probe a Bugzilla server for REST support and return the matching adapter,
/// already logged in. Bugzilla 5.x answers `/rest/version`; older deployments
/// only speak CGI.
pub async fn connect_bugzilla(
    server: &str,
    username: &str,
    password: &str,
) -> Result<Box<dyn SourceAdapter>> {
    let probe = reqwest::Client::new()
        .get(format!("{}/rest/version", server.trim_end_matches('/')))
        .send()
        .await;

    match probe {
        Ok(resp) if resp.status().is_success() => {
            let version = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("version").and_then(|s| s.as_str()).map(str::to_string));
            info!(version = ?version, "Bugzilla REST API detected");
            let mut adapter = RestBugzilla::new(server)?;
            adapter.login(username, password).await?;
            Ok(Box::new(adapter))
        }
        _ => {
            info!("Legacy Bugzilla, falling back to CGI scraping");
            let adapter = CgiBugzilla::new(server)?;
            adapter.login(username, password).await?;
            Ok(Box::new(adapter))
        }
    }
}
