//! Normalized source issue model
//!
//! Every source adapter (legacy Bugzilla, REST Bugzilla, Mantis, JIRA)
//! produces the same `SourceIssue` value so a single Reconciler can migrate
//! all of them. Source issues are ephemeral: reconstructed fresh from the
//! network on every run, never persisted.

use crate::{BzJiraError, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Which tracker an issue came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Legacy Bugzilla scraped over CGI endpoints
    BugzillaCgi,
    /// Bugzilla 5.x native REST API
    BugzillaRest,
    /// Mantis over the mantisconnect SOAP API
    Mantis,
    /// Another JIRA instance queried like the target
    Jira,
}

impl SourceKind {
    /// Prefix applied to numeric ids before storage in the custom field.
    ///
    /// Mantis and Bugzilla share one custom field in the target project, and
    /// the field is queried with a substring match, so plain Mantis numerics
    /// would collide with Bugzilla ids. The prefix disambiguates by
    /// construction. JIRA keys are already non-numeric and self-prefixed.
    pub fn ref_prefix(self) -> &'static str {
        match self {
            SourceKind::Mantis => "Mantis-",
            _ => "",
        }
    }

    /// Tag prepended to migrated summaries, e.g. `[Mantis#7] `
    pub fn summary_tag(self, external_id: &str) -> String {
        match self {
            SourceKind::Mantis => format!("[Mantis#{}] ", external_id),
            SourceKind::BugzillaCgi | SourceKind::BugzillaRest => {
                format!("[BZ#{}] ", external_id)
            }
            SourceKind::Jira => String::new(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SourceKind::BugzillaCgi => "Bugzilla",
            SourceKind::BugzillaRest => "Bugzilla",
            SourceKind::Mantis => "Mantis",
            SourceKind::Jira => "JIRA",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a source comment, used to derive the dedup marker embedded in
/// the migrated comment body. Bugzilla comments are identified by their
/// position in the comment stream; Mantis notes and JIRA comments carry a
/// stable external id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentIdentity {
    Sequence(usize),
    External(String),
}

impl CommentIdentity {
    /// Marker suffix recognized at the end of a migrated comment's first
    /// line. This is the sole comment dedup mechanism; there is no side
    /// index (see reconcile::markers).
    pub fn marker(&self) -> String {
        match self {
            CommentIdentity::Sequence(i) => format!("c{}", i),
            CommentIdentity::External(id) => format!("c{}", id),
        }
    }
}

/// One comment on a source issue, in source order
#[derive(Debug, Clone)]
pub struct SourceComment {
    pub identity: CommentIdentity,
    pub author: String,
    pub timestamp: String,
    pub body: String,
}

/// Lazily fetched attachment content. Mantis only hands out attachment
/// bytes via a second SOAP call, and oversized attachments must never be
/// downloaded at all, so the body is deferred behind this trait.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>>;
}

/// Attachment body: already in hand, or fetched on first use
#[derive(Clone)]
pub enum AttachmentBody {
    Inline(Vec<u8>),
    Deferred(Arc<dyn AttachmentFetcher>),
}

impl fmt::Debug for AttachmentBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachmentBody::Inline(b) => write!(f, "Inline({} bytes)", b.len()),
            AttachmentBody::Deferred(_) => write!(f, "Deferred"),
        }
    }
}

impl AttachmentBody {
    pub async fn bytes(&self) -> Result<Vec<u8>> {
        match self {
            AttachmentBody::Inline(b) => Ok(b.clone()),
            AttachmentBody::Deferred(fetcher) => fetcher.fetch().await,
        }
    }
}

/// One attachment on a source issue
#[derive(Debug, Clone)]
pub struct SourceAttachment {
    /// Stable id in the source system, baked into the migrated filename
    pub external_id: String,
    pub filename: String,
    pub size_bytes: u64,
    /// Direct download link, used by oversized-attachment reference comments
    pub download_url: String,
    pub body: AttachmentBody,
}

/// A normalized source issue, read-only, rebuilt fresh each run
#[derive(Debug, Clone)]
pub struct SourceIssue {
    pub kind: SourceKind,
    /// Globally unique within the source system; the idempotency key
    pub external_id: String,
    pub title: String,
    pub description: String,
    /// Raw source priority string (`P1`, `normal`, `High`, ...)
    pub priority: String,
    /// Raw source status string (`RESOLVED`, `closed`, `Done`, ...)
    pub status: String,
    /// Legacy Bugzilla only; maps to a JIRA resolution name
    pub resolution: Option<String>,
    pub comments: Vec<SourceComment>,
    pub attachments: Vec<SourceAttachment>,
    /// Server base URL, used to build permalinks in migrated comments
    pub web_base: String,
    /// False for non-bug work items pulled from a JIRA source; the
    /// Reconciler skips those outright
    pub is_bug: bool,
    /// Bugzilla delivers the issue description as comment zero; Mantis
    /// notes never include it
    pub first_comment_is_description: bool,
}

impl SourceIssue {
    /// The disambiguated value stored in (and searched against) the
    /// target's external-id custom field
    pub fn external_ref(&self) -> String {
        format!("{}{}", self.kind.ref_prefix(), self.external_id)
    }

    /// Summary as it appears in the target, tagged with the source id
    pub fn tagged_summary(&self) -> String {
        format!("{}{}", self.kind.summary_tag(&self.external_id), self.title)
    }

    /// Target JIRA priority name for this issue
    pub fn jira_priority(&self) -> &'static str {
        map_priority(self.kind, &self.priority)
    }

    /// Permalink to a specific comment on the source side
    pub fn comment_permalink(&self, marker: &str) -> String {
        match self.kind {
            SourceKind::Mantis => {
                format!("{}/view.php?id={}#{}", self.web_base, self.external_id, marker)
            }
            SourceKind::BugzillaCgi | SourceKind::BugzillaRest => format!(
                "{}/show_bug.cgi?id={}#{}",
                self.web_base, self.external_id, marker
            ),
            SourceKind::Jira => {
                // The trailing fragment keeps the first line ending with the
                // dedup marker, like the other trackers' anchors do natively
                format!(
                    "{}/browse/{}?focusedCommentId={}#{}",
                    self.web_base,
                    self.external_id,
                    marker.trim_start_matches('c'),
                    marker
                )
            }
        }
    }

    /// Whether the source considers this issue terminally resolved.
    ///
    /// A status in neither the open nor the terminal set for its tracker is
    /// an error: guessing would silently mis-drive the target workflow.
    pub fn is_resolved(&self) -> Result<bool> {
        source_status_is_terminal(self.kind, &self.status)
    }
}

/// Map a raw source priority to a JIRA priority name.
///
/// Legacy trackers only distinguish P1 from the rest; REST-era sources carry
/// names that JIRA mostly understands, so recognized names pass through.
pub fn map_priority(kind: SourceKind, raw: &str) -> &'static str {
    match kind {
        SourceKind::BugzillaCgi | SourceKind::Mantis => {
            if raw.eq_ignore_ascii_case("P1") {
                "Critical"
            } else {
                "Major"
            }
        }
        SourceKind::BugzillaRest | SourceKind::Jira => match raw.to_lowercase().as_str() {
            "p1" | "highest" | "blocker" | "critical" | "immediate" | "urgent" => "Critical",
            "minor" | "low" | "trivial" | "lowest" => "Minor",
            _ => "Major",
        },
    }
}

lazy_static! {
    /// Bugzilla resolution -> JIRA resolution name.
    ///
    /// Fixed table; anything missing is UnmappedResolution, surfaced to the
    /// operator rather than guessed.
    static ref RESOLUTION_TABLE: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("FIXED", "Fixed");
        m.insert("INVALID", "Invalid");
        m.insert("WONTFIX", "Won't Fix");
        m.insert("LATER", "Remind");
        m.insert("DUPLICATE", "Duplicate");
        m.insert("WORKSFORME", "Cannot Reproduce");
        m.insert("SPECCHANGED", "Spec Changed");
        m
    };
}

/// Map a Bugzilla resolution to the JIRA resolution name
pub fn map_resolution(raw: &str) -> Result<&'static str> {
    RESOLUTION_TABLE
        .get(raw.trim().to_uppercase().as_str())
        .copied()
        .ok_or_else(|| BzJiraError::UnmappedResolution(raw.to_string()))
}

/// Per-tracker status tables. Unknown statuses are an error, not a guess.
fn source_status_is_terminal(kind: SourceKind, status: &str) -> Result<bool> {
    let (open, terminal): (&[&str], &[&str]) = match kind {
        SourceKind::BugzillaCgi | SourceKind::BugzillaRest => (
            &["UNCONFIRMED", "CONFIRMED", "NEW", "ASSIGNED", "IN_PROGRESS", "REOPENED"],
            &["RESOLVED", "VERIFIED", "CLOSED"],
        ),
        SourceKind::Mantis => (
            &["new", "feedback", "acknowledged", "confirmed", "assigned"],
            &["resolved", "closed"],
        ),
        SourceKind::Jira => (
            &["Open", "To Do", "In Progress", "In Review", "Reopened", "Backlog"],
            &["Resolved", "Verified", "Closed", "Done"],
        ),
    };

    if terminal.iter().any(|s| s.eq_ignore_ascii_case(status)) {
        Ok(true)
    } else if open.iter().any(|s| s.eq_ignore_ascii_case(status)) {
        Ok(false)
    } else {
        Err(BzJiraError::UnmappedStatus(format!("{} ({})", status, kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_issue(kind: SourceKind, id: &str, status: &str) -> SourceIssue {
        SourceIssue {
            kind,
            external_id: id.to_string(),
            title: "A bug".to_string(),
            description: String::new(),
            priority: "P2".to_string(),
            status: status.to_string(),
            resolution: None,
            comments: vec![],
            attachments: vec![],
            web_base: "http://tracker.example.com".to_string(),
            is_bug: true,
            first_comment_is_description: true,
        }
    }

    #[test]
    fn test_mantis_ref_is_prefixed() {
        let issue = bare_issue(SourceKind::Mantis, "5", "new");
        assert_eq!(issue.external_ref(), "Mantis-5");

        let issue = bare_issue(SourceKind::BugzillaCgi, "5", "NEW");
        assert_eq!(issue.external_ref(), "5");
    }

    #[test]
    fn test_tagged_summary() {
        let issue = bare_issue(SourceKind::Mantis, "7", "new");
        assert_eq!(issue.tagged_summary(), "[Mantis#7] A bug");

        let issue = bare_issue(SourceKind::BugzillaRest, "42", "NEW");
        assert_eq!(issue.tagged_summary(), "[BZ#42] A bug");
    }

    #[test]
    fn test_priority_mapping() {
        assert_eq!(map_priority(SourceKind::BugzillaCgi, "P1"), "Critical");
        assert_eq!(map_priority(SourceKind::BugzillaCgi, "P3"), "Major");
        assert_eq!(map_priority(SourceKind::BugzillaRest, "Highest"), "Critical");
        assert_eq!(map_priority(SourceKind::BugzillaRest, "Low"), "Minor");
        assert_eq!(map_priority(SourceKind::Jira, "weird"), "Major");
    }

    #[test]
    fn test_resolution_table() {
        assert_eq!(map_resolution("FIXED").unwrap(), "Fixed");
        assert_eq!(map_resolution("wontfix").unwrap(), "Won't Fix");
        assert_eq!(map_resolution("SpecChanged").unwrap(), "Spec Changed");
        assert!(matches!(
            map_resolution("MAYBE"),
            Err(BzJiraError::UnmappedResolution(_))
        ));
    }

    #[test]
    fn test_status_tables() {
        assert!(bare_issue(SourceKind::BugzillaCgi, "1", "RESOLVED").is_resolved().unwrap());
        assert!(bare_issue(SourceKind::BugzillaCgi, "1", "VERIFIED").is_resolved().unwrap());
        assert!(!bare_issue(SourceKind::BugzillaCgi, "1", "NEW").is_resolved().unwrap());
        assert!(bare_issue(SourceKind::Mantis, "1", "closed").is_resolved().unwrap());
        assert!(!bare_issue(SourceKind::Mantis, "1", "feedback").is_resolved().unwrap());
        assert!(matches!(
            bare_issue(SourceKind::Mantis, "1", "half-done").is_resolved(),
            Err(BzJiraError::UnmappedStatus(_))
        ));
    }

    #[test]
    fn test_comment_markers() {
        assert_eq!(CommentIdentity::Sequence(3).marker(), "c3");
        assert_eq!(CommentIdentity::External("1234".to_string()).marker(), "c1234");
    }

    #[test]
    fn test_comment_permalinks() {
        let issue = bare_issue(SourceKind::BugzillaCgi, "42", "NEW");
        assert_eq!(
            issue.comment_permalink("c3"),
            "http://tracker.example.com/show_bug.cgi?id=42#c3"
        );
        let issue = bare_issue(SourceKind::Mantis, "9", "new");
        assert_eq!(
            issue.comment_permalink("c77"),
            "http://tracker.example.com/view.php?id=9#c77"
        );
    }

    #[test]
    fn test_permalinks_end_with_the_marker() {
        // The comment matcher keys on the first line ending with the marker,
        // so every kind's permalink must end with it
        for kind in [
            SourceKind::BugzillaCgi,
            SourceKind::BugzillaRest,
            SourceKind::Mantis,
            SourceKind::Jira,
        ] {
            let issue = bare_issue(kind, "OLD-7", "Open");
            assert!(
                issue.comment_permalink("c9001").ends_with("c9001"),
                "{} permalink lost the marker",
                kind
            );
        }
    }
}
