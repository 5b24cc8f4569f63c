//! Mantis adapter (mantisconnect SOAP)
//!
//! Mantis has no session: username and password ride on every call. Issue
//! bodies come from `mc_issue_get`; attachment bytes are only available via
//! a second `mc_issue_attachment_get` call, so they are fetched lazily.
//!
//! Mantis emits timestamps with a non-conformant UTC offset (`+0800`, colon
//! missing). The fix-up is applied here, at the adapter boundary, instead of
//! patching the deserializer globally.

use crate::model::{
    AttachmentBody, AttachmentFetcher, CommentIdentity, SourceAttachment, SourceComment,
    SourceIssue, SourceKind,
};
use crate::retry::{with_retry, RetryConfig};
use crate::source::xml::XmlElement;
use crate::source::SourceAdapter;
use crate::{BzJiraError, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::DateTime;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SOAP_PATH: &str = "/api/soap/mantisconnect.php";

/// Mantis page size for filter queries; pages are fetched until a short page
const FILTER_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct MantisClient {
    client: Client,
    server: String,
    username: String,
    password: String,
    retry: RetryConfig,
}

impl MantisClient {
    pub fn new(server: &str, username: &str, password: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(120)).build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            retry: RetryConfig::for_source_fetch(),
        })
    }

    /// Issue a SOAP call and return the `<return>` element of the response
    async fn soap_call(&self, operation: &str, params: &[(&str, &str)]) -> Result<XmlElement> {
        let envelope = build_envelope(operation, &self.username, &self.password, params);
        let url = format!("{}{}", self.server, SOAP_PATH);

        let body = with_retry(&self.retry, operation, || async {
            let response = self
                .client
                .post(&url)
                .header("Content-Type", "text/xml; charset=utf-8")
                .header("SOAPAction", format!("\"{}\"", operation))
                .body(envelope.clone())
                .send()
                .await?;
            // SOAP faults come back as HTTP 500 with a fault envelope;
            // let the XML layer classify those rather than retrying them
            let status = response.status();
            let text = response.text().await?;
            if !status.is_success() && !text.contains("Fault") {
                return Err(BzJiraError::Source(format!(
                    "Mantis request failed: HTTP {}",
                    status
                )));
            }
            Ok(text)
        })
        .await?;

        let root = XmlElement::parse(&body)?;

        if let Some(fault) = root.find("faultstring") {
            let fault = fault.text.trim().to_string();
            if fault.contains("not found") || fault.contains("does not exist") {
                return Err(BzJiraError::IssueNotFound(fault));
            }
            if fault.contains("Access denied") || fault.contains("username or password") {
                return Err(BzJiraError::Auth(format!("Mantis: {}", fault)));
            }
            return Err(BzJiraError::Source(format!("Mantis fault: {}", fault)));
        }

        root.find("return").cloned().ok_or_else(|| {
            BzJiraError::Parse(format!("Mantis {}: no <return> in response", operation))
        })
    }

    fn normalize_issue(&self, ret: &XmlElement) -> Result<SourceIssue> {
        let external_id = ret.require_text("id")?;

        let comments = ret
            .child("notes")
            .map(|notes| {
                notes
                    .children_named("item")
                    .map(parse_note)
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let attachments = ret
            .child("attachments")
            .map(|atts| {
                atts.children_named("item")
                    .map(|a| self.parse_attachment(a))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let status = ret
            .child("status")
            .and_then(|s| s.child_text("name"))
            .ok_or_else(|| BzJiraError::Parse("Mantis issue without status name".to_string()))?;
        let priority = ret
            .child("priority")
            .and_then(|p| p.child_text("name"))
            .unwrap_or_default();

        Ok(SourceIssue {
            kind: SourceKind::Mantis,
            title: ret.require_text("summary")?,
            description: ret.child_text("description").unwrap_or_default(),
            priority,
            status,
            resolution: None,
            comments,
            attachments,
            web_base: self.server.clone(),
            is_bug: true,
            // Mantis notes are replies only; the description is separate
            first_comment_is_description: false,
            external_id,
        })
    }

    fn parse_attachment(&self, item: &XmlElement) -> Result<SourceAttachment> {
        let external_id = item.require_text("id")?;
        let size_bytes = item
            .child_text("size")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let download_url = item.child_text("download_url").unwrap_or_else(|| {
            format!(
                "{}/file_download.php?file_id={}&type=bug",
                self.server, external_id
            )
        });

        Ok(SourceAttachment {
            filename: item.require_text("filename")?,
            size_bytes,
            download_url,
            body: AttachmentBody::Deferred(Arc::new(MantisAttachmentFetcher {
                client: self.clone(),
                attachment_id: external_id.clone(),
            })),
            external_id,
        })
    }
}

/// Deferred fetch of attachment bytes through `mc_issue_attachment_get`
struct MantisAttachmentFetcher {
    client: MantisClient,
    attachment_id: String,
}

#[async_trait]
impl AttachmentFetcher for MantisAttachmentFetcher {
    async fn fetch(&self) -> Result<Vec<u8>> {
        debug!(id = %self.attachment_id, "Fetching Mantis attachment content");
        let ret = self
            .client
            .soap_call(
                "mc_issue_attachment_get",
                &[("issue_attachment_id", &self.attachment_id)],
            )
            .await?;
        base64::engine::general_purpose::STANDARD
            .decode(ret.text.split_whitespace().collect::<String>())
            .map_err(|e| {
                BzJiraError::Parse(format!(
                    "Mantis attachment {}: bad base64: {}",
                    self.attachment_id, e
                ))
            })
    }
}

fn parse_note(item: &XmlElement) -> Result<SourceComment> {
    let author = item
        .child("reporter")
        .and_then(|r| r.child_text("name"))
        .unwrap_or_default();
    let timestamp = item
        .child_text("last_modified")
        .map(|t| fixup_timestamp(&t))
        .unwrap_or_default();

    Ok(SourceComment {
        identity: CommentIdentity::External(item.require_text("id")?),
        author,
        timestamp,
        body: item.child_text("text").unwrap_or_default(),
    })
}

/// Repair Mantis's non-conformant UTC offset (`2014-01-02T03:04:05+0800`)
/// and render a readable timestamp. Values that still do not parse are
/// passed through untouched; the timestamp is display-only.
pub fn fixup_timestamp(raw: &str) -> String {
    let repaired = repair_offset(raw);
    match DateTime::parse_from_rfc3339(&repaired) {
        Ok(dt) => dt.format("%Y-%m-%d %H:%M:%S %z").to_string(),
        Err(_) => raw.to_string(),
    }
}

/// Insert the missing colon into a trailing `+HHMM`/`-HHMM` offset
fn repair_offset(raw: &str) -> String {
    let bytes = raw.as_bytes();
    if bytes.len() >= 5 {
        let tail = &bytes[bytes.len() - 5..];
        let sign_ok = tail[0] == b'+' || tail[0] == b'-';
        let digits_ok = tail[1..].iter().all(u8::is_ascii_digit);
        if sign_ok && digits_ok {
            let (head, tail) = raw.split_at(raw.len() - 2);
            return format!("{}:{}", head, tail);
        }
    }
    raw.to_string()
}

#[async_trait]
impl SourceAdapter for MantisClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Mantis
    }

    async fn fetch_issue(&self, id: &str) -> Result<SourceIssue> {
        debug!(id = %id, "Fetching Mantis issue");
        let ret = self.soap_call("mc_issue_get", &[("issue_id", id)]).await?;
        let issue = self.normalize_issue(&ret)?;
        info!(id = %id, summary = %issue.title, "Mantis issue found");
        Ok(issue)
    }

    /// Query is `project_id:filter_id`; pages through the stored filter
    async fn fetch_issue_list(&self, query: &str) -> Result<Vec<String>> {
        let (project_id, filter_id) = query.split_once(':').ok_or_else(|| {
            BzJiraError::Config(format!(
                "Mantis query must be <project_id>:<filter_id>, got {:?}",
                query
            ))
        })?;

        let per_page = FILTER_PAGE_SIZE.to_string();
        let mut ids = Vec::new();
        let mut page = 1usize;
        loop {
            let page_number = page.to_string();
            let ret = self
                .soap_call(
                    "mc_filter_get_issues",
                    &[
                        ("project_id", project_id),
                        ("filter_id", filter_id),
                        ("page_number", &page_number),
                        ("per_page", &per_page),
                    ],
                )
                .await?;

            let mut count = 0usize;
            for item in ret.children_named("item") {
                if let Some(id) = item.child_text("id") {
                    ids.push(id);
                    count += 1;
                }
            }
            if count < FILTER_PAGE_SIZE {
                break;
            }
            page += 1;
        }

        info!(query = %query, count = ids.len(), "Mantis filter resolved");
        Ok(ids)
    }
}

/// Build a SOAP 1.1 request envelope. Credentials lead every call; Mantis
/// has no session concept.
fn build_envelope(
    operation: &str,
    username: &str,
    password: &str,
    params: &[(&str, &str)],
) -> String {
    let mut body = String::new();
    body.push_str(&format!(
        "<username>{}</username><password>{}</password>",
        escape_xml(username),
        escape_xml(password)
    ));
    for (name, value) in params {
        body.push_str(&format!("<{}>{}</{}>", name, escape_xml(value), name));
    }

    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
            "<SOAP-ENV:Envelope xmlns:SOAP-ENV=\"http://schemas.xmlsoap.org/soap/envelope/\" ",
            "xmlns:ns1=\"http://futureware.biz/mantisconnect\">",
            "<SOAP-ENV:Body><ns1:{op}>{body}</ns1:{op}></SOAP-ENV:Body>",
            "</SOAP-ENV:Envelope>"
        ),
        op = operation,
        body = body
    )
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
