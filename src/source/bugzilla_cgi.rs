//! Legacy Bugzilla adapter (CGI scraping)
//!
//! Pre-REST Bugzilla exposes no API; this adapter logs in through
//! `index.cgi` (session cookie), fetches issues as `show_bug.cgi?ctype=xml`
//! and resolves queries through the `buglist.cgi?ctype=rss` feed.

use crate::model::{
    AttachmentBody, CommentIdentity, SourceAttachment, SourceComment, SourceIssue, SourceKind,
};
use crate::retry::{with_retry, RetryConfig};
use crate::source::xml::XmlElement;
use crate::source::SourceAdapter;
use crate::{BzJiraError, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

/// Legacy Bugzilla client. Holds the session cookie jar established at login.
pub struct CgiBugzilla {
    client: Client,
    server: String,
    retry: RetryConfig,
}

impl CgiBugzilla {
    pub fn new(server: &str) -> Result<Self> {
        // Attachments ride inside the issue XML, so fetches can be slow
        let client = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            retry: RetryConfig::for_source_fetch(),
        })
    }

    /// Establish the CGI session. Bugzilla sets login cookies on the
    /// response; a wrong password still answers 200 with no cookies, which
    /// surfaces later as an empty fetch, so verify we got any cookie at all.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/index.cgi", self.server))
            .form(&[
                ("Bugzilla_login", username),
                ("Bugzilla_password", password),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BzJiraError::Auth(format!(
                "Bugzilla login failed: HTTP {}",
                response.status()
            )));
        }
        if response.cookies().next().is_none() {
            return Err(BzJiraError::Auth(
                "Bugzilla login rejected (no session cookie issued)".to_string(),
            ));
        }
        info!(server = %self.server, "Bugzilla CGI session established");
        Ok(())
    }

    async fn get_text(&self, url: String) -> Result<String> {
        let body = with_retry(&self.retry, "bugzilla_cgi_get", || async {
            let response = self.client.get(&url).send().await?;
            if !response.status().is_success() {
                return Err(BzJiraError::Source(format!(
                    "Bugzilla request failed: HTTP {}: {}",
                    response.status(),
                    url
                )));
            }
            Ok(response.text().await?)
        })
        .await?;
        Ok(body)
    }

    fn parse_issue(&self, id: &str, xml: &str) -> Result<SourceIssue> {
        let root = XmlElement::parse(xml)?;
        let bug = root
            .child("bug")
            .ok_or_else(|| BzJiraError::Parse(format!("bug {}: no <bug> element", id)))?;

        // show_bug answers 200 with an error attribute for unknown ids
        if let Some(error) = bug.attr("error") {
            if error == "NotFound" || error == "InvalidBugId" {
                return Err(BzJiraError::IssueNotFound(id.to_string()));
            }
            return Err(BzJiraError::Source(format!("bug {}: {}", id, error)));
        }

        let external_id = bug.require_text("bug_id")?;
        let comments: Vec<SourceComment> = bug
            .children_named("long_desc")
            .enumerate()
            .map(|(index, desc)| parse_long_desc(index, desc))
            .collect::<Result<_>>()?;

        let description = comments
            .first()
            .map(|c| c.body.clone())
            .unwrap_or_default();

        let attachments = bug
            .children_named("attachment")
            .map(|a| self.parse_attachment(a))
            .collect::<Result<_>>()?;

        Ok(SourceIssue {
            kind: SourceKind::BugzillaCgi,
            title: bug.require_text("short_desc")?,
            description,
            priority: bug.child_text("priority").unwrap_or_default(),
            status: bug.require_text("bug_status")?,
            resolution: bug.child_text("resolution").filter(|r| !r.is_empty()),
            comments,
            attachments,
            web_base: self.server.clone(),
            is_bug: true,
            first_comment_is_description: true,
            external_id,
        })
    }

    fn parse_attachment(&self, element: &XmlElement) -> Result<SourceAttachment> {
        let external_id = element.require_text("attachid")?;
        let data = element
            .child("data")
            .map(|d| d.text.split_whitespace().collect::<String>())
            .unwrap_or_default();
        let content = base64::engine::general_purpose::STANDARD
            .decode(&data)
            .map_err(|e| {
                BzJiraError::Parse(format!("attachment {}: bad base64: {}", external_id, e))
            })?;

        Ok(SourceAttachment {
            download_url: format!("{}/attachment.cgi?id={}", self.server, external_id),
            filename: element.require_text("filename")?,
            size_bytes: content.len() as u64,
            body: AttachmentBody::Inline(content),
            external_id,
        })
    }
}

fn parse_long_desc(index: usize, element: &XmlElement) -> Result<SourceComment> {
    let who = element
        .child("who")
        .ok_or_else(|| BzJiraError::Parse("long_desc without <who>".to_string()))?;
    // Display name is an attribute; the element text is the login address
    let author = who
        .attr("name")
        .map(str::to_string)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| who.text.trim().to_string());

    Ok(SourceComment {
        identity: CommentIdentity::Sequence(index),
        author,
        timestamp: element.child_text("bug_when").unwrap_or_default(),
        body: element.child_text("thetext").unwrap_or_default(),
    })
}

#[async_trait]
impl SourceAdapter for CgiBugzilla {
    fn kind(&self) -> SourceKind {
        SourceKind::BugzillaCgi
    }

    async fn fetch_issue(&self, id: &str) -> Result<SourceIssue> {
        let url = format!("{}/show_bug.cgi?ctype=xml&id={}", self.server, id);
        debug!(id = %id, "Fetching Bugzilla issue");
        let xml = self.get_text(url).await?;
        self.parse_issue(id, &xml)
    }

    /// Resolve a buglist query through the RSS feed; ids come from the
    /// trailing `id=` parameter of each entry link
    async fn fetch_issue_list(&self, query: &str) -> Result<Vec<String>> {
        let url = format!("{}/buglist.cgi?ctype=rss&{}", self.server, query);
        let xml = self.get_text(url).await?;
        let feed = XmlElement::parse(&xml)?;

        let mut ids = Vec::new();
        for entry in feed.children_named("entry") {
            if let Some(id_text) = entry.child_text("id") {
                if let Some(id) = id_text.rsplit('=').next() {
                    ids.push(id.to_string());
                }
            }
        }
        info!(query = %query, count = ids.len(), "Bugzilla buglist resolved");
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUG_XML: &str = r#"<?xml version="1.0"?>
<bugzilla version="3.6">
  <bug>
    <bug_id>42</bug_id>
    <short_desc>Crash on save</short_desc>
    <priority>P1</priority>
    <bug_status>RESOLVED</bug_status>
    <resolution>FIXED</resolution>
    <long_desc>
      <who name="Alice Smith">alice@example.com</who>
      <bug_when>2014-02-01 10:00:00</bug_when>
      <thetext>It crashes when saving.</thetext>
    </long_desc>
    <long_desc>
      <who name="Bob">bob@example.com</who>
      <bug_when>2014-02-02 11:00:00</bug_when>
      <thetext>Confirmed on trunk.</thetext>
    </long_desc>
    <attachment>
      <attachid>7</attachid>
      <filename>log.txt</filename>
      <data encoding="base64">aGVsbG8=</data>
    </attachment>
  </bug>
</bugzilla>"#;

    fn adapter() -> CgiBugzilla {
        CgiBugzilla::new("http://bz.example.com/").unwrap()
    }

    #[test]
    fn test_parse_issue() {
        let issue = adapter().parse_issue("42", BUG_XML).unwrap();
        assert_eq!(issue.external_id, "42");
        assert_eq!(issue.title, "Crash on save");
        assert_eq!(issue.status, "RESOLVED");
        assert_eq!(issue.resolution.as_deref(), Some("FIXED"));
        assert_eq!(issue.priority, "P1");
        assert_eq!(issue.description, "It crashes when saving.");
        assert!(issue.first_comment_is_description);

        assert_eq!(issue.comments.len(), 2);
        assert_eq!(issue.comments[0].identity, CommentIdentity::Sequence(0));
        assert_eq!(issue.comments[1].author, "Bob");

        assert_eq!(issue.attachments.len(), 1);
        let a = &issue.attachments[0];
        assert_eq!(a.external_id, "7");
        assert_eq!(a.filename, "log.txt");
        assert_eq!(a.size_bytes, 5);
    }

    #[tokio::test]
    async fn test_parse_attachment_content() {
        let issue = adapter().parse_issue("42", BUG_XML).unwrap();
        let bytes = issue.attachments[0].body.bytes().await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_not_found_error_attr() {
        let xml = r#"<bugzilla><bug error="NotFound"><bug_id>999</bug_id></bug></bugzilla>"#;
        assert!(matches!(
            adapter().parse_issue("999", xml),
            Err(BzJiraError::IssueNotFound(_))
        ));
    }

    #[test]
    fn test_missing_status_is_parse_error() {
        let xml = r#"<bugzilla><bug><bug_id>1</bug_id><short_desc>x</short_desc></bug></bugzilla>"#;
        assert!(matches!(
            adapter().parse_issue("1", xml),
            Err(BzJiraError::Parse(_))
        ));
    }
}
