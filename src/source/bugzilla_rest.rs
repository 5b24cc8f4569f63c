//! REST Bugzilla adapter (Bugzilla 5.x native API)
//!
//! Token-based login, then three JSON endpoints per issue: the bug body,
//! its comment stream and its attachment list.

use crate::model::{
    AttachmentBody, CommentIdentity, SourceAttachment, SourceComment, SourceIssue, SourceKind,
};
use crate::retry::{with_retry, RetryConfig};
use crate::source::SourceAdapter;
use crate::{BzJiraError, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

pub struct RestBugzilla {
    client: Client,
    server: String,
    token: Option<String>,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct BugsResponse {
    bugs: Vec<RawBug>,
}

#[derive(Debug, Deserialize)]
struct RawBug {
    id: u64,
    summary: String,
    priority: String,
    status: String,
    #[serde(default)]
    resolution: String,
}

#[derive(Debug, Deserialize)]
struct IdsResponse {
    bugs: Vec<RawBugId>,
}

#[derive(Debug, Deserialize)]
struct RawBugId {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct CommentsResponse {
    // Keyed by bug id: { "bugs": { "42": { "comments": [...] } } }
    bugs: HashMap<String, CommentList>,
}

#[derive(Debug, Deserialize)]
struct CommentList {
    comments: Vec<RawComment>,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    creator: String,
    time: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentsResponse {
    // Keyed by bug id: { "bugs": { "42": [ {...} ] } }
    bugs: HashMap<String, Vec<RawAttachment>>,
}

#[derive(Debug, Deserialize)]
struct RawAttachment {
    id: u64,
    file_name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    data: Option<String>,
}

impl RestBugzilla {
    pub fn new(server: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(120)).build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            token: None,
            retry: RetryConfig::for_source_fetch(),
        })
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/rest/login", self.server))
            .query(&[("login", username), ("password", password)])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let login: LoginResponse = response.json().await?;
                self.token = Some(login.token);
                info!(server = %self.server, "Bugzilla REST login ok");
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(BzJiraError::Auth(format!(
                    "Bugzilla REST login failed: HTTP {}: {}",
                    status, body
                )))
            }
        }
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| BzJiraError::Auth("Bugzilla REST: not logged in".to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        id_for_errors: &str,
    ) -> Result<T> {
        let url = format!("{}{}", self.server, path);
        let token = self.token()?;

        with_retry(&self.retry, "bugzilla_rest_get", || async {
            let response = self
                .client
                .get(&url)
                .query(&[("token", token)])
                .send()
                .await?;
            match response.status() {
                StatusCode::OK => Ok(response.json::<T>().await?),
                StatusCode::NOT_FOUND => {
                    Err(BzJiraError::IssueNotFound(id_for_errors.to_string()))
                }
                StatusCode::UNAUTHORIZED => Err(BzJiraError::Auth(
                    "Bugzilla REST token rejected".to_string(),
                )),
                status => {
                    let body = response.text().await.unwrap_or_default();
                    Err(BzJiraError::Source(format!(
                        "Bugzilla REST request failed: HTTP {}: {}",
                        status, body
                    )))
                }
            }
        })
        .await
    }
}

#[async_trait]
impl SourceAdapter for RestBugzilla {
    fn kind(&self) -> SourceKind {
        SourceKind::BugzillaRest
    }

    async fn fetch_issue(&self, id: &str) -> Result<SourceIssue> {
        debug!(id = %id, "Fetching Bugzilla issue over REST");

        let body: BugsResponse = self.get_json(&format!("/rest/bug/{}", id), id).await?;
        let bug = body
            .bugs
            .into_iter()
            .next()
            .ok_or_else(|| BzJiraError::IssueNotFound(id.to_string()))?;

        let comments: CommentsResponse = self
            .get_json(&format!("/rest/bug/{}/comment", id), id)
            .await?;
        let comments = comments
            .bugs
            .get(id)
            .map(|list| {
                list.comments
                    .iter()
                    .enumerate()
                    .map(|(index, c)| SourceComment {
                        identity: CommentIdentity::Sequence(index),
                        author: c.creator.clone(),
                        timestamp: c.time.clone(),
                        body: c.text.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let attachments: AttachmentsResponse = self
            .get_json(&format!("/rest/bug/{}/attachment", id), id)
            .await?;
        let attachments = attachments
            .bugs
            .get(id)
            .map(|list| {
                list.iter()
                    .map(|a| self.normalize_attachment(a))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let description = comments
            .first()
            .map(|c: &SourceComment| c.body.clone())
            .unwrap_or_default();

        Ok(SourceIssue {
            kind: SourceKind::BugzillaRest,
            external_id: bug.id.to_string(),
            title: bug.summary,
            description,
            priority: bug.priority,
            status: bug.status,
            resolution: Some(bug.resolution).filter(|r| !r.is_empty()),
            comments,
            attachments,
            web_base: self.server.clone(),
            is_bug: true,
            first_comment_is_description: true,
        })
    }

    /// Query string is passed through to `/rest/bug`, restricted to ids
    async fn fetch_issue_list(&self, query: &str) -> Result<Vec<String>> {
        let url = format!("{}/rest/bug?{}", self.server, query);
        let token = self.token()?;

        let ids: IdsResponse = with_retry(&self.retry, "bugzilla_rest_query", || async {
            let response = self
                .client
                .get(&url)
                .query(&[("token", token), ("include_fields", "id")])
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(BzJiraError::Source(format!(
                    "Bugzilla REST query failed: HTTP {}: {}",
                    status, body
                )));
            }
            Ok(response.json().await?)
        })
        .await?;

        let ids: Vec<String> = ids.bugs.into_iter().map(|b| b.id.to_string()).collect();
        info!(query = %query, count = ids.len(), "Bugzilla REST query resolved");
        Ok(ids)
    }
}

impl RestBugzilla {
    fn normalize_attachment(&self, raw: &RawAttachment) -> Result<SourceAttachment> {
        let content = match &raw.data {
            Some(data) => base64::engine::general_purpose::STANDARD
                .decode(data.split_whitespace().collect::<String>())
                .map_err(|e| {
                    BzJiraError::Parse(format!("attachment {}: bad base64: {}", raw.id, e))
                })?,
            None => Vec::new(),
        };
        let size_bytes = raw.size.unwrap_or(content.len() as u64);

        Ok(SourceAttachment {
            external_id: raw.id.to_string(),
            filename: raw.file_name.clone(),
            size_bytes,
            download_url: format!("{}/attachment.cgi?id={}", self.server, raw.id),
            body: AttachmentBody::Inline(content),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comments_response_shape() {
        let raw = r#"{ "bugs": { "42": { "comments": [
            { "creator": "alice", "time": "2020-01-01T00:00:00Z", "text": "desc" },
            { "creator": "bob", "time": "2020-01-02T00:00:00Z", "text": "reply" }
        ] } } }"#;
        let parsed: CommentsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.bugs.get("42").unwrap().comments.len(), 2);
    }

    #[test]
    fn test_attachments_response_shape() {
        let raw = r#"{ "attachments": {}, "bugs": { "42": [
            { "id": 7, "file_name": "log.txt", "size": 5, "data": "aGVsbG8=" }
        ] } }"#;
        let parsed: AttachmentsResponse = serde_json::from_str(raw).unwrap();
        let adapter = RestBugzilla::new("http://bz.example.com").unwrap();
        let a = adapter
            .normalize_attachment(&parsed.bugs.get("42").unwrap()[0])
            .unwrap();
        assert_eq!(a.external_id, "7");
        assert_eq!(a.size_bytes, 5);
        assert!(a.download_url.ends_with("/attachment.cgi?id=7"));
    }

    #[test]
    fn test_bug_resolution_empty_is_none() {
        let raw = r#"{ "bugs": [ { "id": 42, "summary": "s", "priority": "P2", "status": "NEW" } ] }"#;
        let parsed: BugsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.bugs[0].resolution, "");
    }
}
