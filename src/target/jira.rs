//! JIRA REST client for the target project
//!
//! Implements [`TargetStore`] against the JIRA REST API (v2; the instances
//! this tool targets predate the v3 document-format comment bodies). Also
//! exposes the raw search/get operations the JIRA-as-source adapter reuses.

use crate::target::{IssueSummary, NewIssue, TargetIssue, TargetStore, TransitionRequest};
use crate::{BzJiraError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Per-request timeout for search/query operations (large result sets)
const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-request timeout for single issue fetches
const GET_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request timeout for create/comment/transition operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);
/// Per-request timeout for attachment uploads
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Hard cap on search result pages; JIRA truncates server-side anyway, and
/// the revert scan must bound memory
const MAX_SEARCH_RESULTS: u32 = 1000;

/// Target JIRA configuration
#[derive(Debug, Clone)]
pub struct JiraTarget {
    /// JIRA instance URL
    pub url: String,
    /// Custom field id holding the source external ref, e.g. `customfield_10216`
    pub external_field_id: String,
    /// Human name of that field as used in JQL, e.g. `BugZilla ID`
    pub external_field_name: String,
}

/// Authentication for a JIRA instance
#[derive(Debug, Clone)]
pub enum JiraAuth {
    Basic { username: String, password: String },
    Bearer(String),
}

/// JIRA API client
pub struct JiraClient {
    client: Client,
    config: JiraTarget,
    base_url: String,
    agile_url: String,
    auth: JiraAuth,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    issues: Vec<RawIssue>,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    key: String,
    fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TransitionsResponse {
    transitions: Vec<RawTransition>,
}

#[derive(Debug, Deserialize)]
struct RawTransition {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct SprintPage {
    values: Vec<RawSprint>,
}

#[derive(Debug, Deserialize)]
struct RawSprint {
    id: u64,
    name: String,
}

impl JiraClient {
    /// Create a new JIRA client
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: JiraTarget, auth: JiraAuth) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        let root = config.url.trim_end_matches('/').to_string();
        let base_url = format!("{}/rest/api/2", root);
        let agile_url = format!("{}/rest/agile/1.0", root);

        Ok(Self {
            client,
            config,
            base_url,
            agile_url,
            auth,
        })
    }

    pub fn config(&self) -> &JiraTarget {
        &self.config
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            JiraAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            JiraAuth::Bearer(token) => request.bearer_auth(token),
        }
    }

    /// Sanitize a value for safe interpolation into a JQL string. External
    /// refs are ids and keys; anything else would be injection.
    fn sanitize_jql_value(value: &str) -> String {
        value
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
            .collect()
    }

    /// Run a JQL search returning raw issues with the requested fields
    pub async fn search_raw(&self, jql: &str, fields: &str, max_results: u32) -> Result<Vec<(String, serde_json::Map<String, serde_json::Value>)>> {
        let url = format!("{}/search", self.base_url);
        let max = max_results.min(MAX_SEARCH_RESULTS);

        let params = [
            ("jql", jql.to_string()),
            ("maxResults", max.to_string()),
            ("fields", fields.to_string()),
        ];

        debug!(jql = %jql, max_results = max, "Searching JIRA issues");

        let request = self.authed(self.client.get(&url).query(&params));
        let response = request.timeout(SEARCH_TIMEOUT).send().await?;

        match response.status() {
            StatusCode::OK => {
                let result: SearchResponse = response.json().await?;
                debug!(returned = result.issues.len(), "JIRA search complete");
                Ok(result
                    .issues
                    .into_iter()
                    .map(|i| (i.key, i.fields))
                    .collect())
            }
            StatusCode::UNAUTHORIZED => {
                Err(BzJiraError::Auth("JIRA authentication failed".to_string()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);
                Err(BzJiraError::RateLimited(retry_after))
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(BzJiraError::Jira(format!(
                    "JIRA search failed: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }

    /// Fetch a raw issue by key with the requested fields
    pub async fn get_issue_raw(
        &self,
        key: &str,
        fields: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let url = format!("{}/issue/{}", self.base_url, key);

        debug!(key = %key, "Fetching JIRA issue");

        let request = self.authed(self.client.get(&url).query(&[("fields", fields)]));
        let response = request.timeout(GET_TIMEOUT).send().await?;

        match response.status() {
            StatusCode::OK => {
                let raw: RawIssue = response.json().await?;
                Ok(raw.fields)
            }
            StatusCode::NOT_FOUND => Err(BzJiraError::IssueNotFound(key.to_string())),
            StatusCode::UNAUTHORIZED => {
                Err(BzJiraError::Auth("JIRA authentication failed".to_string()))
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(BzJiraError::Jira(format!(
                    "JIRA get {} failed: HTTP {}: {}",
                    key, status, error_body
                )))
            }
        }
    }

    fn summary_fields(&self) -> String {
        format!("status,{}", self.config.external_field_id)
    }

    fn detail_fields(&self) -> String {
        format!("status,attachment,comment,{}", self.config.external_field_id)
    }

    fn extract_external_ref(&self, fields: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
        fields
            .get(&self.config.external_field_id)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn parse_detail(&self, key: &str, fields: serde_json::Map<String, serde_json::Value>) -> Result<TargetIssue> {
        let status = fields
            .get("status")
            .and_then(|s| s.get("name"))
            .and_then(|n| n.as_str())
            .ok_or_else(|| {
                BzJiraError::Parse(format!("issue {} has no status in response", key))
            })?
            .to_string();

        let attachment_filenames = fields
            .get("attachment")
            .and_then(|a| a.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|a| a.get("filename").and_then(|f| f.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let comment_bodies = fields
            .get("comment")
            .and_then(|c| c.get("comments"))
            .and_then(|c| c.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| c.get("body").and_then(|b| b.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(TargetIssue {
            key: key.to_string(),
            status,
            external_ref: self.extract_external_ref(&fields),
            attachment_filenames,
            comment_bodies,
        })
    }

    /// Download raw bytes from a URL on this instance with this client's
    /// credentials (attachment content links)
    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let request = self.authed(self.client.get(url));
        let response = request.timeout(UPLOAD_TIMEOUT).send().await?;

        match response.status() {
            StatusCode::OK => Ok(response.bytes().await?.to_vec()),
            status => Err(BzJiraError::Jira(format!(
                "JIRA download failed: HTTP {}: {}",
                status, url
            ))),
        }
    }

    async fn find_transition_id(&self, key: &str, name: &str) -> Result<String> {
        let url = format!("{}/issue/{}/transitions", self.base_url, key);

        let request = self.authed(self.client.get(&url));
        let response = request.timeout(GET_TIMEOUT).send().await?;

        match response.status() {
            StatusCode::OK => {
                let result: TransitionsResponse = response.json().await?;
                result
                    .transitions
                    .iter()
                    .find(|t| t.name.eq_ignore_ascii_case(name))
                    .map(|t| t.id.clone())
                    .ok_or_else(|| {
                        BzJiraError::Jira(format!(
                            "no transition named {:?} available on {} (have: {:?})",
                            name,
                            key,
                            result.transitions.iter().map(|t| &t.name).collect::<Vec<_>>()
                        ))
                    })
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(BzJiraError::Jira(format!(
                    "JIRA transitions for {} failed: HTTP {}: {}",
                    key, status, error_body
                )))
            }
        }
    }
}

#[async_trait]
impl TargetStore for JiraClient {
    async fn search_by_external_ref(
        &self,
        project_key: &str,
        external_ref: &str,
    ) -> Result<Vec<IssueSummary>> {
        let safe_ref = Self::sanitize_jql_value(external_ref);
        if safe_ref.is_empty() {
            return Err(BzJiraError::Config(
                "external ref is empty after sanitization".to_string(),
            ));
        }
        // JIRA text custom-field search is substring-based, not exact; the
        // caller verifies the match against the fetched detail.
        let jql = format!(
            "project = {} AND \"{}\" ~ \"{}\"",
            Self::sanitize_jql_value(project_key),
            self.config.external_field_name,
            safe_ref
        );

        let hits = self.search_raw(&jql, &self.summary_fields(), 50).await?;
        Ok(hits
            .into_iter()
            .map(|(key, fields)| IssueSummary {
                external_ref: self.extract_external_ref(&fields),
                key,
            })
            .collect())
    }

    async fn scan_linked_open_issues(
        &self,
        project_key: &str,
        max: u32,
    ) -> Result<Vec<IssueSummary>> {
        let jql = format!(
            "project = {} AND \"{}\" is not empty AND status not in (\"Resolved\", \"Closed\", \"Remind\")",
            Self::sanitize_jql_value(project_key),
            self.config.external_field_name,
        );

        let hits = self.search_raw(&jql, &self.summary_fields(), max).await?;
        Ok(hits
            .into_iter()
            .map(|(key, fields)| IssueSummary {
                external_ref: self.extract_external_ref(&fields),
                key,
            })
            .collect())
    }

    async fn get_issue(&self, key: &str) -> Result<TargetIssue> {
        let fields = self.get_issue_raw(key, &self.detail_fields()).await?;
        self.parse_detail(key, fields)
    }

    async fn create_issue(&self, new_issue: &NewIssue) -> Result<TargetIssue> {
        let url = format!("{}/issue", self.base_url);

        let mut fields = json!({
            "project": { "key": new_issue.project_key },
            "summary": new_issue.summary,
            "description": new_issue.description,
            "issuetype": { "name": "Bug" },
            "priority": { "name": new_issue.priority },
        });
        // Custom field id is configuration, not a literal key
        fields[self.config.external_field_id.as_str()] = json!(new_issue.external_ref);
        let body = json!({ "fields": fields });

        info!(
            project = %new_issue.project_key,
            external_ref = %new_issue.external_ref,
            "Creating JIRA issue"
        );

        let request = self.authed(self.client.post(&url).json(&body));
        let response = request.timeout(WRITE_TIMEOUT).send().await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                #[derive(Deserialize)]
                struct Created {
                    key: String,
                }
                let created: Created = response.json().await?;
                info!(key = %created.key, "New JIRA issue created");
                Ok(TargetIssue {
                    key: created.key,
                    status: "Open".to_string(),
                    external_ref: Some(new_issue.external_ref.clone()),
                    ..Default::default()
                })
            }
            StatusCode::UNAUTHORIZED => {
                Err(BzJiraError::Auth("JIRA authentication failed".to_string()))
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(BzJiraError::Jira(format!(
                    "JIRA create failed: HTTP {}: {}",
                    status, error_body
                )))
            }
        }
    }

    async fn add_attachment(&self, key: &str, filename: &str, content: Vec<u8>) -> Result<()> {
        let url = format!("{}/issue/{}/attachments", self.base_url, key);

        let size = content.len();
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| BzJiraError::Jira(format!("bad attachment part: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        info!(key = %key, filename = %filename, bytes = size, "Attaching file to JIRA issue");

        let request = self.authed(
            self.client
                .post(&url)
                // JIRA rejects attachment posts without this header (XSRF check)
                .header("X-Atlassian-Token", "no-check")
                .multipart(form),
        );
        let response = request.timeout(UPLOAD_TIMEOUT).send().await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(BzJiraError::Jira(format!(
                    "JIRA attachment to {} failed: HTTP {}: {}",
                    key, status, error_body
                )))
            }
        }
    }

    async fn add_comment(&self, key: &str, body: &str) -> Result<()> {
        let url = format!("{}/issue/{}/comment", self.base_url, key);

        info!(key = %key, "Adding comment to JIRA issue");

        let request = self.authed(self.client.post(&url).json(&json!({ "body": body })));
        let response = request.timeout(WRITE_TIMEOUT).send().await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(BzJiraError::Jira(format!(
                    "JIRA comment on {} failed: HTTP {}: {}",
                    key, status, error_body
                )))
            }
        }
    }

    async fn transition_issue(&self, key: &str, req: &TransitionRequest) -> Result<()> {
        let transition_id = self.find_transition_id(key, &req.name).await?;
        let url = format!("{}/issue/{}/transitions", self.base_url, key);

        let mut fields = req.fields.clone();
        if let Some(ref resolution) = req.resolution {
            fields.insert("resolution".to_string(), json!({ "name": resolution }));
        }

        let mut body = json!({
            "transition": { "id": transition_id },
        });
        if !fields.is_empty() {
            body["fields"] = serde_json::Value::Object(fields);
        }
        if let Some(ref comment) = req.comment {
            body["update"] = json!({ "comment": [ { "add": { "body": comment } } ] });
        }

        info!(key = %key, transition = %req.name, resolution = ?req.resolution, "Transitioning JIRA issue");

        let request = self.authed(self.client.post(&url).json(&body));
        let response = request.timeout(WRITE_TIMEOUT).send().await?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(BzJiraError::Jira(format!(
                    "JIRA transition {:?} on {} failed: HTTP {}: {}",
                    req.name, key, status, error_body
                )))
            }
        }
    }

    async fn move_to_active_sprint(&self, board_id: u64, key: &str) -> Result<()> {
        let url = format!("{}/board/{}/sprint", self.agile_url, board_id);

        let request = self.authed(self.client.get(&url).query(&[("state", "active")]));
        let response = request.timeout(GET_TIMEOUT).send().await?;

        let sprint = match response.status() {
            StatusCode::OK => {
                let page: SprintPage = response.json().await?;
                match page.values.into_iter().next() {
                    Some(s) => s,
                    None => {
                        debug!(board = board_id, "No active sprint on board, leaving issue in backlog");
                        return Ok(());
                    }
                }
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                return Err(BzJiraError::Jira(format!(
                    "JIRA sprint lookup on board {} failed: HTTP {}: {}",
                    board_id, status, error_body
                )));
            }
        };

        let url = format!("{}/sprint/{}/issue", self.agile_url, sprint.id);
        let request = self.authed(self.client.post(&url).json(&json!({ "issues": [key] })));
        let response = request.timeout(WRITE_TIMEOUT).send().await?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => {
                info!(key = %key, sprint = %sprint.name, "Moved issue into active sprint");
                Ok(())
            }
            status => {
                let error_body = response.text().await.unwrap_or_default();
                Err(BzJiraError::Jira(format!(
                    "JIRA sprint move of {} failed: HTTP {}: {}",
                    key, status, error_body
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> JiraClient {
        JiraClient::new(
            JiraTarget {
                url: "https://jira.example.com/".to_string(),
                external_field_id: "customfield_10216".to_string(),
                external_field_name: "BugZilla ID".to_string(),
            },
            JiraAuth::Basic {
                username: "u".to_string(),
                password: "p".to_string(),
            },
        )
        .expect("client")
    }

    #[test]
    fn test_base_urls_trim_trailing_slash() {
        let client = test_client();
        assert_eq!(client.base_url, "https://jira.example.com/rest/api/2");
        assert_eq!(client.agile_url, "https://jira.example.com/rest/agile/1.0");
    }

    #[test]
    fn test_jql_value_sanitization() {
        assert_eq!(JiraClient::sanitize_jql_value("Mantis-5"), "Mantis-5");
        assert_eq!(JiraClient::sanitize_jql_value("OLD_PROJ"), "OLD_PROJ");
        // Injection attempts lose their quoting characters
        assert_eq!(
            JiraClient::sanitize_jql_value("5\" OR project = SECRET"),
            "5ORprojectSECRET"
        );
    }

    #[test]
    fn test_parse_detail() {
        let client = test_client();
        let fields: serde_json::Map<String, serde_json::Value> = serde_json::from_str(
            r#"{
                "status": { "name": "Open" },
                "customfield_10216": "Mantis-5",
                "attachment": [ { "filename": "log-7.txt" } ],
                "comment": { "comments": [ { "body": "url#c1\n\nhello" } ] }
            }"#,
        )
        .unwrap();

        let detail = client.parse_detail("PROJ-1", fields).unwrap();
        assert_eq!(detail.status, "Open");
        assert_eq!(detail.external_ref.as_deref(), Some("Mantis-5"));
        assert_eq!(detail.attachment_filenames, vec!["log-7.txt"]);
        assert_eq!(detail.comment_bodies.len(), 1);
    }

    #[test]
    fn test_parse_detail_requires_status() {
        let client = test_client();
        let fields: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{ "summary": "x" }"#).unwrap();
        assert!(matches!(
            client.parse_detail("PROJ-1", fields),
            Err(BzJiraError::Parse(_))
        ));
    }
}
