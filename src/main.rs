//! bzjira command-line interface
//!
//! One run drives one source tracker against one target JIRA project. Items
//! fail independently: a bad issue is logged and skipped, and only setup
//! problems (bad arguments, unreachable server, rejected login) abort the
//! run with a non-zero exit.

use anyhow::{bail, Context};
use bzjira::config::{self, Credentials};
use bzjira::model::SourceKind;
use bzjira::reconcile::{ReconcileOptions, ReconcileOutcome, Reconciler, WorkflowStyle};
use bzjira::source::{connect_bugzilla, JiraSource, MantisClient, SourceAdapter};
use bzjira::target::jira::{JiraAuth, JiraClient, JiraTarget};
use bzjira::target::TargetStore;
use bzjira::BzJiraError;
use clap::{Parser, ValueEnum};
use dialoguer::{Confirm, Input, Password};
use tracing::{error, info, warn};

/// Cap on the revert scan, matching the target's own search truncation
const REVERT_SCAN_MAX: u32 = 1000;

#[derive(Parser)]
#[command(name = "bzjira", version, about = "Migrate Bugzilla/Mantis/JIRA issues into a JIRA project, idempotently")]
#[command(group(clap::ArgGroup::new("source").required(true)))]
struct Cli {
    /// Issue ids to migrate (or queries, with --query)
    #[arg(required_unless_present = "revert_scan")]
    items: Vec<String>,

    /// Bugzilla server URL (REST is probed, CGI is the fallback)
    #[arg(long, group = "source", env = "BZJIRA_BUGZILLA_URL")]
    bugzilla: Option<String>,

    /// Mantis server URL (mantisconnect SOAP)
    #[arg(long, group = "source", env = "BZJIRA_MANTIS_URL")]
    mantis: Option<String>,

    /// Source JIRA instance URL
    #[arg(long, group = "source", env = "BZJIRA_SOURCE_JIRA_URL")]
    source_jira: Option<String>,

    /// Target JIRA instance URL
    #[arg(long, env = "BZJIRA_JIRA_URL")]
    jira: String,

    /// Target JIRA project key
    #[arg(long, short, env = "BZJIRA_PROJECT")]
    project: String,

    /// Custom field id holding the source external ref
    #[arg(long, default_value = "customfield_10216")]
    field_id: String,

    /// JQL name of that custom field
    #[arg(long, default_value = "BugZilla ID")]
    field_name: String,

    /// Treat each positional argument as a source query instead of an id
    #[arg(long, short)]
    query: bool,

    /// Re-check all open target issues linked to this source for resolution
    #[arg(long, short)]
    revert_scan: bool,

    /// Answer yes to every confirmation prompt
    #[arg(long, short)]
    yes: bool,

    /// Agile board whose active sprint receives newly created issues
    #[arg(long)]
    board: Option<u64>,

    /// Resolve workflow of the target project
    #[arg(long, value_enum, default_value = "two-step")]
    workflow: WorkflowArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WorkflowArg {
    /// Single "Resolve Issue" transition carrying the mapped resolution
    Legacy,
    /// Open -> Assigned -> Resolved, one step per pass
    TwoStep,
}

impl From<WorkflowArg> for WorkflowStyle {
    fn from(arg: WorkflowArg) -> Self {
        match arg {
            WorkflowArg::Legacy => WorkflowStyle::LegacyResolve,
            WorkflowArg::TwoStep => WorkflowStyle::TwoStep,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bzjira::logging::init()?;
    let cli = Cli::parse();

    let source = build_source(&cli).await.context("connecting to source tracker")?;

    let target_creds = credentials_for(&cli.jira).context("target JIRA credentials")?;
    let target = JiraClient::new(
        JiraTarget {
            url: cli.jira.clone(),
            external_field_id: cli.field_id.clone(),
            external_field_name: cli.field_name.clone(),
        },
        JiraAuth::Basic {
            username: target_creds.username,
            password: target_creds.password,
        },
    )?;

    let options = ReconcileOptions::new(cli.project.clone())
        .with_workflow(cli.workflow.into())
        .with_board(cli.board)
        .with_confirm(
            cli.yes,
            Box::new(|prompt| {
                Confirm::new()
                    .with_prompt(prompt.to_string())
                    .default(true)
                    .interact()
                    .unwrap_or(false)
            }),
        );
    let reconciler = Reconciler::new(&target, options);

    let ids = collect_ids(&cli, source.as_ref(), &target)
        .await
        .context("resolving issue list")?;
    info!(count = ids.len(), source = %source.kind(), "Starting migration run");

    let mut failures = 0u32;
    for id in &ids {
        match migrate_one(source.as_ref(), &reconciler, id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                // Legacy and new-system id spaces overlap; absent is normal
                info!(id = %id, "Not in {}, skipping", source.kind());
            }
            Err(e) => {
                failures += 1;
                error!(id = %id, error = %e, "Migration failed, continuing");
            }
        }
    }

    if failures > 0 {
        warn!(failures, total = ids.len(), "Run finished with per-item failures");
    } else {
        info!(total = ids.len(), "Run finished");
    }
    Ok(())
}

async fn migrate_one(
    source: &dyn SourceAdapter,
    reconciler: &Reconciler<'_>,
    id: &str,
) -> bzjira::Result<()> {
    let issue = source.fetch_issue(id).await?;
    match reconciler.reconcile(&issue).await? {
        ReconcileOutcome::SkippedNonBug => {}
        ReconcileOutcome::SkippedClosed { key } => {
            info!(id = %id, key = %key, "Already closed in JIRA");
        }
        ReconcileOutcome::Declined => {
            info!(id = %id, "Skipped at operator request");
        }
        ReconcileOutcome::Synced(report) => {
            info!(
                id = %id,
                key = %report.key,
                created = report.created,
                attachments = report.attachments_migrated,
                comments = report.comments_migrated,
                transition = ?report.transitioned_to,
                "Issue reconciled"
            );
        }
    }
    Ok(())
}

async fn build_source(cli: &Cli) -> anyhow::Result<Box<dyn SourceAdapter>> {
    if let Some(ref url) = cli.bugzilla {
        let creds = credentials_for(url)?;
        return Ok(connect_bugzilla(url, &creds.username, &creds.password).await?);
    }
    if let Some(ref url) = cli.mantis {
        let creds = credentials_for(url)?;
        return Ok(Box::new(MantisClient::new(url, &creds.username, &creds.password)?));
    }
    if let Some(ref url) = cli.source_jira {
        let creds = credentials_for(url)?;
        let client = JiraClient::new(
            JiraTarget {
                url: url.clone(),
                external_field_id: cli.field_id.clone(),
                external_field_name: cli.field_name.clone(),
            },
            JiraAuth::Basic {
                username: creds.username,
                password: creds.password,
            },
        )?;
        return Ok(Box::new(JiraSource::new(client)));
    }
    bail!("one of --bugzilla, --mantis or --source-jira is required");
}

/// Resolve the id list for this run: explicit ids, source queries, or the
/// revert scan over open target issues already linked to this source.
async fn collect_ids(
    cli: &Cli,
    source: &dyn SourceAdapter,
    target: &JiraClient,
) -> bzjira::Result<Vec<String>> {
    if cli.revert_scan {
        let open = target
            .scan_linked_open_issues(&cli.project, REVERT_SCAN_MAX)
            .await?;
        let ids: Vec<String> = open
            .into_iter()
            .filter_map(|summary| summary.external_ref)
            .filter_map(|r| source_id_from_ref(source.kind(), &r))
            .collect();
        info!(count = ids.len(), "Revert scan resolved open linked issues");
        return Ok(ids);
    }

    if cli.query {
        let mut ids = Vec::new();
        for query in &cli.items {
            ids.extend(source.fetch_issue_list(query).await?);
        }
        return Ok(ids);
    }

    Ok(cli.items.clone())
}

/// Map a stored external ref back to a source issue id, if the ref belongs
/// to this source kind. The target field mixes refs from every tracker.
fn source_id_from_ref(kind: SourceKind, external_ref: &str) -> Option<String> {
    match kind {
        SourceKind::Mantis => external_ref
            .strip_prefix("Mantis-")
            .map(str::to_string),
        SourceKind::BugzillaCgi | SourceKind::BugzillaRest => {
            external_ref.parse::<u64>().ok().map(|_| external_ref.to_string())
        }
        SourceKind::Jira => {
            (external_ref.contains('-') && !external_ref.starts_with("Mantis-"))
                .then(|| external_ref.to_string())
        }
    }
}

/// .netrc first, interactive prompt second
fn credentials_for(url: &str) -> bzjira::Result<Credentials> {
    let host = config::host_of(url)?;
    if let Some(creds) = config::netrc_credentials(&host) {
        return Ok(creds);
    }

    let username: String = Input::new()
        .with_prompt(format!("Username for {}", host))
        .interact_text()
        .map_err(|e| BzJiraError::Config(format!("cannot prompt for credentials: {}", e)))?;
    let password = Password::new()
        .with_prompt(format!("Password for {}", host))
        .interact()
        .map_err(|e| BzJiraError::Config(format!("cannot prompt for credentials: {}", e)))?;

    Ok(Credentials { username, password })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_filtering_by_source_kind() {
        assert_eq!(
            source_id_from_ref(SourceKind::Mantis, "Mantis-5").as_deref(),
            Some("5")
        );
        assert_eq!(source_id_from_ref(SourceKind::Mantis, "42"), None);

        assert_eq!(
            source_id_from_ref(SourceKind::BugzillaCgi, "42").as_deref(),
            Some("42")
        );
        assert_eq!(source_id_from_ref(SourceKind::BugzillaCgi, "Mantis-5"), None);
        assert_eq!(source_id_from_ref(SourceKind::BugzillaRest, "OLD-7"), None);

        assert_eq!(
            source_id_from_ref(SourceKind::Jira, "OLD-7").as_deref(),
            Some("OLD-7")
        );
        assert_eq!(source_id_from_ref(SourceKind::Jira, "Mantis-5"), None);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "bzjira",
            "--bugzilla", "http://bz.example.com",
            "--jira", "https://jira.example.com",
            "--project", "PROJ",
            "-y",
            "42", "43",
        ])
        .unwrap();
        assert_eq!(cli.items, vec!["42", "43"]);
        assert!(cli.yes);
        assert!(!cli.query);
    }

    #[test]
    fn test_cli_sources_are_exclusive() {
        let result = Cli::try_parse_from([
            "bzjira",
            "--bugzilla", "http://bz.example.com",
            "--mantis", "http://mantis.example.com",
            "--jira", "https://jira.example.com",
            "--project", "PROJ",
            "42",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_revert_scan_needs_no_ids() {
        let cli = Cli::try_parse_from([
            "bzjira",
            "--mantis", "http://mantis.example.com",
            "--jira", "https://jira.example.com",
            "--project", "PROJ",
            "--revert-scan",
        ])
        .unwrap();
        assert!(cli.revert_scan);
        assert!(cli.items.is_empty());
    }
}
