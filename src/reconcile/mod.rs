//! Idempotent reconciliation of a source issue against the target project
//!
//! Given a normalized [`SourceIssue`] and a [`TargetStore`], decide whether a
//! corresponding target issue exists, create or update it, and migrate
//! attachments, comments and status transitions without duplicating any of
//! them on re-run. All "already migrated?" decisions are made by live
//! queries against the target; the Reconciler holds no state between calls.

pub mod markers;

use crate::model::{map_resolution, SourceIssue};
use crate::target::{NewIssue, TargetIssue, TargetStore, TransitionRequest};
use crate::{BzJiraError, Result};
use serde_json::json;
use tracing::{debug, info, warn};

/// How the target project's resolve workflow is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStyle {
    /// Single `Resolve Issue` transition carrying the mapped resolution
    LegacyResolve,
    /// `Open -> Assigned -> Resolved`, one step per reconcile pass, with
    /// placeholder resolution metadata supplied at the Resolved step
    TwoStep,
}

/// Target statuses from which no further transition is driven
const TARGET_RESOLVED_SET: &[&str] = &["Resolved", "Verified", "Closed"];
/// Target status that freezes the issue entirely
const TARGET_TERMINAL: &str = "Closed";
/// Sentinel for required transition fields the source cannot provide
const FIELD_SENTINEL: &str = "N/A";

/// Confirmation predicate injected by the driver. The prompt text is passed
/// through; returning false declines the current item only.
pub type ConfirmFn = dyn Fn(&str) -> bool + Send + Sync;

/// Reconciliation policy
pub struct ReconcileOptions {
    pub project_key: String,
    pub workflow: WorkflowStyle,
    /// Move newly created issues into the active sprint on this board
    pub board_id: Option<u64>,
    /// Skip the interactive gate entirely
    pub auto_confirm: bool,
    pub confirm: Box<ConfirmFn>,
}

impl ReconcileOptions {
    pub fn new(project_key: impl Into<String>) -> Self {
        Self {
            project_key: project_key.into(),
            workflow: WorkflowStyle::TwoStep,
            board_id: None,
            auto_confirm: true,
            confirm: Box::new(|_| true),
        }
    }

    pub fn with_workflow(mut self, workflow: WorkflowStyle) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn with_board(mut self, board_id: Option<u64>) -> Self {
        self.board_id = board_id;
        self
    }

    pub fn with_confirm(mut self, auto_confirm: bool, confirm: Box<ConfirmFn>) -> Self {
        self.auto_confirm = auto_confirm;
        self.confirm = confirm;
        self
    }

    fn confirmed(&self, prompt: &str) -> bool {
        self.auto_confirm || (self.confirm)(prompt)
    }
}

/// What a reconcile pass did for one source issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Source record is not a bug work item; nothing done
    SkippedNonBug,
    /// Matching target issue is Closed; never touched again
    SkippedClosed { key: String },
    /// Operator declined at the confirmation gate
    Declined,
    /// Issue created or updated
    Synced(SyncReport),
}

/// Per-item migration counts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub key: String,
    pub created: bool,
    pub attachments_migrated: u32,
    pub attachment_references: u32,
    pub attachments_failed: u32,
    pub comments_migrated: u32,
    pub transitioned_to: Option<String>,
}

/// The reconciliation engine
pub struct Reconciler<'a> {
    store: &'a dyn TargetStore,
    options: ReconcileOptions,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn TargetStore, options: ReconcileOptions) -> Self {
        Self { store, options }
    }

    /// Reconcile one source issue against the target project
    pub async fn reconcile(&self, source: &SourceIssue) -> Result<ReconcileOutcome> {
        if !source.is_bug {
            info!(external_id = %source.external_id, "Skipping non-bug work item");
            return Ok(ReconcileOutcome::SkippedNonBug);
        }

        let external_ref = source.external_ref();
        let matched = self.find_match(&external_ref).await?;

        let (mut target, created) = match matched {
            Some(existing) => {
                info!(key = %existing.key, external_ref = %external_ref, "Corresponding JIRA issue found");
                if existing.status == TARGET_TERMINAL {
                    info!(key = %existing.key, "Skip due to issue closed");
                    return Ok(ReconcileOutcome::SkippedClosed { key: existing.key });
                }
                if !self.options.confirmed(&format!("Update issue {}?", existing.key)) {
                    return Ok(ReconcileOutcome::Declined);
                }
                (existing, false)
            }
            None => {
                if !self
                    .options
                    .confirmed(&format!("Create a new issue for {} {}?", source.kind, source.external_id))
                {
                    return Ok(ReconcileOutcome::Declined);
                }
                let created = self
                    .store
                    .create_issue(&NewIssue {
                        project_key: self.options.project_key.clone(),
                        summary: source.tagged_summary(),
                        description: source.description.clone(),
                        priority: source.jira_priority().to_string(),
                        external_ref: external_ref.clone(),
                    })
                    .await?;
                if let Some(board_id) = self.options.board_id {
                    if let Err(e) = self.store.move_to_active_sprint(board_id, &created.key).await {
                        warn!(key = %created.key, error = %e, "Sprint placement failed");
                    }
                }
                (created, true)
            }
        };

        let mut report = SyncReport {
            key: target.key.clone(),
            created,
            ..Default::default()
        };

        self.migrate_attachments(source, &mut target, &mut report).await;
        self.migrate_comments(source, &mut target, &mut report).await?;
        report.transitioned_to = self.advance_status(source, &target).await?;

        Ok(ReconcileOutcome::Synced(report))
    }

    /// Match by substring search on the custom field, then verify exactness
    /// against the fetched detail. Substring search over-matches (`5` hits
    /// `15` and `Mantis-5`), so only an exactly-equal candidate counts.
    /// Two exact candidates violate the at-most-one-issue-per-ref invariant
    /// and are fatal: a re-run must never pick one arbitrarily.
    async fn find_match(&self, external_ref: &str) -> Result<Option<TargetIssue>> {
        let hits = self
            .store
            .search_by_external_ref(&self.options.project_key, external_ref)
            .await?;

        let mut exact: Option<TargetIssue> = None;
        for hit in &hits {
            // Search results are summaries; detail has the authoritative
            // field value plus the attachment/comment lists we need anyway.
            let detail = self.store.get_issue(&hit.key).await?;
            if detail.external_ref.as_deref() != Some(external_ref) {
                debug!(
                    key = %hit.key,
                    stored = ?detail.external_ref,
                    wanted = %external_ref,
                    "Substring hit rejected by exact comparison"
                );
                continue;
            }
            if let Some(ref previous) = exact {
                return Err(BzJiraError::AmbiguousMatch {
                    external_ref: external_ref.to_string(),
                    jira_key: format!("{}, {}", previous.key, detail.key),
                    stored: detail.external_ref,
                });
            }
            exact = Some(detail);
        }
        Ok(exact)
    }

    /// Migrate attachments idempotently. Per-attachment failures are logged
    /// and skipped; they never abort the rest of the issue.
    async fn migrate_attachments(
        &self,
        source: &SourceIssue,
        target: &mut TargetIssue,
        report: &mut SyncReport,
    ) {
        for attachment in &source.attachments {
            let filename = markers::attachment_filename(&attachment.filename, &attachment.external_id);

            if target.attachment_filenames.iter().any(|f| f == &filename) {
                debug!(key = %target.key, filename = %filename, "Attachment already migrated");
                continue;
            }

            if attachment.size_bytes >= markers::OVERSIZE_THRESHOLD_BYTES {
                if markers::has_attachment_reference(&target.comment_bodies, &attachment.external_id) {
                    debug!(key = %target.key, id = %attachment.external_id, "Oversized attachment already referenced");
                    continue;
                }
                let body = markers::render_attachment_reference(attachment);
                match self.store.add_comment(&target.key, &body).await {
                    Ok(()) => {
                        info!(key = %target.key, id = %attachment.external_id, "Posted oversized-attachment reference");
                        target.comment_bodies.push(body);
                        report.attachment_references += 1;
                    }
                    Err(e) => {
                        warn!(key = %target.key, id = %attachment.external_id, error = %e, "Reference comment failed");
                        report.attachments_failed += 1;
                    }
                }
                continue;
            }

            let content = match attachment.body.bytes().await {
                Ok(content) => content,
                Err(e) => {
                    warn!(key = %target.key, id = %attachment.external_id, error = %e, "Attachment fetch failed, skipping");
                    report.attachments_failed += 1;
                    continue;
                }
            };

            match self.store.add_attachment(&target.key, &filename, content).await {
                Ok(()) => {
                    info!(key = %target.key, filename = %filename, bytes = attachment.size_bytes, "File attached");
                    target.attachment_filenames.push(filename);
                    report.attachments_migrated += 1;
                }
                Err(e) => {
                    warn!(key = %target.key, filename = %filename, error = %e, "Attachment upload failed, skipping");
                    report.attachments_failed += 1;
                }
            }
        }
    }

    /// Migrate comments idempotently, skipping the zeroth entry when it is
    /// the issue description rather than a reply.
    async fn migrate_comments(
        &self,
        source: &SourceIssue,
        target: &mut TargetIssue,
        report: &mut SyncReport,
    ) -> Result<()> {
        for (index, comment) in source.comments.iter().enumerate() {
            if index == 0 && source.first_comment_is_description {
                continue;
            }

            let marker = comment.identity.marker();
            let already = target
                .comment_bodies
                .iter()
                .any(|body| markers::comment_matches_marker(body, &marker));
            if already {
                debug!(key = %target.key, marker = %marker, "Comment already migrated");
                continue;
            }

            let body = markers::render_comment(source, comment);
            self.store.add_comment(&target.key, &body).await?;
            info!(key = %target.key, marker = %marker, "Comment created");
            target.comment_bodies.push(body);
            report.comments_migrated += 1;
        }
        Ok(())
    }

    /// Push the target workflow forward when the source is terminally
    /// resolved. Never pushes backward, never touches a resolved target.
    /// Returns the transition name driven, if any.
    async fn advance_status(
        &self,
        source: &SourceIssue,
        target: &TargetIssue,
    ) -> Result<Option<String>> {
        if !source.is_resolved()? {
            return Ok(None);
        }
        if TARGET_RESOLVED_SET.iter().any(|s| *s == target.status) {
            return Ok(None);
        }

        let resolution = match source.resolution.as_deref() {
            Some(r) if !r.is_empty() => Some(map_resolution(r)?.to_string()),
            _ => None,
        };
        let comment = format!(
            "Change to Resolved due to {} #{} is {}",
            source.kind, source.external_id, source.status
        );

        let request = match self.options.workflow {
            WorkflowStyle::LegacyResolve => TransitionRequest {
                name: "Resolve Issue".to_string(),
                resolution,
                comment: Some(comment),
                fields: serde_json::Map::new(),
            },
            WorkflowStyle::TwoStep => {
                if target.status == "Open" {
                    // First pass only assigns; the resolve step runs on the
                    // next pass once the issue is in Assigned.
                    TransitionRequest {
                        name: "Assigned".to_string(),
                        resolution: None,
                        comment: None,
                        fields: serde_json::Map::new(),
                    }
                } else {
                    let mut fields = serde_json::Map::new();
                    // The source has no structured equivalents for these
                    // required workflow fields.
                    fields.insert("customfield_14101".to_string(), json!(FIELD_SENTINEL));
                    fields.insert("customfield_14102".to_string(), json!(FIELD_SENTINEL));
                    TransitionRequest {
                        name: "Resolved".to_string(),
                        resolution: resolution.or_else(|| Some("Fixed".to_string())),
                        comment: Some(comment),
                        fields,
                    }
                }
            }
        };

        self.store.transition_issue(&target.key, &request).await?;
        info!(key = %target.key, transition = %request.name, "Workflow advanced");
        Ok(Some(request.name))
    }
}
