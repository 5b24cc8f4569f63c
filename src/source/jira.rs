//! JIRA-as-source adapter
//!
//! Some legacy projects already live in a JIRA instance; migrating them into
//! the consolidated project reuses the same REST client as the target side,
//! read-only. Only issues of type Bug are migrated; everything else is
//! normalized with `is_bug = false` and skipped downstream.

use crate::model::{
    AttachmentBody, AttachmentFetcher, CommentIdentity, SourceAttachment, SourceComment,
    SourceIssue, SourceKind,
};
use crate::source::SourceAdapter;
use crate::target::jira::JiraClient;
use crate::{BzJiraError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const ISSUE_FIELDS: &str = "summary,description,status,priority,issuetype,comment,attachment";

/// Read-only view of a source JIRA instance
pub struct JiraSource {
    client: Arc<JiraClient>,
}

impl JiraSource {
    pub fn new(client: JiraClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    fn normalize(&self, key: &str, fields: &serde_json::Map<String, serde_json::Value>) -> Result<SourceIssue> {
        let status = nested_name(fields, "status").ok_or_else(|| {
            BzJiraError::Parse(format!("issue {} has no status in response", key))
        })?;
        let is_bug = nested_name(fields, "issuetype")
            .map(|t| t == "Bug")
            .unwrap_or(false);

        let comments = fields
            .get("comment")
            .and_then(|c| c.get("comments"))
            .and_then(|c| c.as_array())
            .map(|arr| arr.iter().map(parse_comment).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();

        let attachments = fields
            .get("attachment")
            .and_then(|a| a.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|a| self.parse_attachment(a))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(SourceIssue {
            kind: SourceKind::Jira,
            external_id: key.to_string(),
            title: str_field(fields, "summary").unwrap_or_default(),
            description: str_field(fields, "description").unwrap_or_default(),
            priority: nested_name(fields, "priority").unwrap_or_default(),
            status,
            resolution: None,
            comments,
            attachments,
            web_base: self.client.config().url.trim_end_matches('/').to_string(),
            is_bug,
            // JIRA keeps the description out of the comment stream
            first_comment_is_description: false,
        })
    }

    fn parse_attachment(&self, raw: &serde_json::Value) -> Result<SourceAttachment> {
        let external_id = raw
            .get("id")
            .and_then(|i| i.as_str())
            .ok_or_else(|| BzJiraError::Parse("attachment without id".to_string()))?
            .to_string();
        let content_url = raw
            .get("content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                BzJiraError::Parse(format!("attachment {} without content URL", external_id))
            })?
            .to_string();

        Ok(SourceAttachment {
            filename: raw
                .get("filename")
                .and_then(|f| f.as_str())
                .unwrap_or("attachment")
                .to_string(),
            size_bytes: raw.get("size").and_then(|s| s.as_u64()).unwrap_or(0),
            download_url: content_url.clone(),
            body: AttachmentBody::Deferred(Arc::new(JiraAttachmentFetcher {
                client: Arc::clone(&self.client),
                content_url,
            })),
            external_id,
        })
    }
}

/// Deferred download of attachment bytes over the authenticated client
struct JiraAttachmentFetcher {
    client: Arc<JiraClient>,
    content_url: String,
}

#[async_trait]
impl AttachmentFetcher for JiraAttachmentFetcher {
    async fn fetch(&self) -> Result<Vec<u8>> {
        debug!(url = %self.content_url, "Downloading JIRA attachment content");
        self.client.download(&self.content_url).await
    }
}

fn parse_comment(raw: &serde_json::Value) -> Result<SourceComment> {
    let id = raw
        .get("id")
        .and_then(|i| i.as_str())
        .ok_or_else(|| BzJiraError::Parse("comment without id".to_string()))?
        .to_string();

    Ok(SourceComment {
        identity: CommentIdentity::External(id),
        author: raw
            .get("author")
            .and_then(|a| a.get("displayName"))
            .and_then(|n| n.as_str())
            .unwrap_or_default()
            .to_string(),
        timestamp: raw
            .get("created")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string(),
        body: raw
            .get("body")
            .and_then(|b| b.as_str())
            .unwrap_or_default()
            .to_string(),
    })
}

fn str_field(fields: &serde_json::Map<String, serde_json::Value>, name: &str) -> Option<String> {
    fields.get(name).and_then(|v| v.as_str()).map(str::to_string)
}

/// Extract `fields[name].name` (status, priority, issuetype all nest the
/// display name this way)
fn nested_name(fields: &serde_json::Map<String, serde_json::Value>, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(|v| v.get("name"))
        .and_then(|n| n.as_str())
        .map(str::to_string)
}

#[async_trait]
impl SourceAdapter for JiraSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Jira
    }

    async fn fetch_issue(&self, id: &str) -> Result<SourceIssue> {
        let fields = self.client.get_issue_raw(id, ISSUE_FIELDS).await?;
        self.normalize(id, &fields)
    }

    /// Query is a JQL expression; resolves to issue keys
    async fn fetch_issue_list(&self, query: &str) -> Result<Vec<String>> {
        let hits = self.client.search_raw(query, "summary", 1000).await?;
        Ok(hits.into_iter().map(|(key, _)| key).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::jira::{JiraAuth, JiraTarget};

    fn source() -> JiraSource {
        JiraSource::new(
            JiraClient::new(
                JiraTarget {
                    url: "https://old-jira.example.com/".to_string(),
                    external_field_id: "customfield_10216".to_string(),
                    external_field_name: "BugZilla ID".to_string(),
                },
                JiraAuth::Basic {
                    username: "u".to_string(),
                    password: "p".to_string(),
                },
            )
            .expect("client"),
        )
    }

    fn fields(raw: &str) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_normalize_bug() {
        let fields = fields(
            r#"{
                "summary": "Old bug",
                "description": "Long ago",
                "status": { "name": "Open" },
                "priority": { "name": "Blocker" },
                "issuetype": { "name": "Bug" },
                "comment": { "comments": [
                    { "id": "9001", "author": { "displayName": "Dana" },
                      "created": "2019-05-01T10:00:00.000+0000", "body": "still broken" }
                ] },
                "attachment": [
                    { "id": "310", "filename": "trace.log", "size": 512,
                      "content": "https://old-jira.example.com/secure/attachment/310/trace.log" }
                ]
            }"#,
        );
        let issue = source().normalize("OLD-7", &fields).unwrap();

        assert!(issue.is_bug);
        assert_eq!(issue.external_id, "OLD-7");
        assert_eq!(issue.external_ref(), "OLD-7");
        assert_eq!(issue.tagged_summary(), "Old bug");
        assert_eq!(issue.jira_priority(), "Critical");
        assert!(!issue.first_comment_is_description);

        assert_eq!(issue.comments.len(), 1);
        assert_eq!(
            issue.comments[0].identity,
            CommentIdentity::External("9001".to_string())
        );
        assert_eq!(issue.comments[0].author, "Dana");

        assert_eq!(issue.attachments.len(), 1);
        assert_eq!(issue.attachments[0].size_bytes, 512);
        assert!(matches!(
            issue.attachments[0].body,
            AttachmentBody::Deferred(_)
        ));
    }

    #[test]
    fn test_non_bug_is_flagged() {
        let fields = fields(
            r#"{ "summary": "Ship it", "status": { "name": "Open" },
                 "issuetype": { "name": "Task" } }"#,
        );
        let issue = source().normalize("OLD-8", &fields).unwrap();
        assert!(!issue.is_bug);
    }

    #[test]
    fn test_missing_status_is_parse_error() {
        let fields = fields(r#"{ "summary": "x", "issuetype": { "name": "Bug" } }"#);
        assert!(matches!(
            source().normalize("OLD-9", &fields),
            Err(BzJiraError::Parse(_))
        ));
    }
}
