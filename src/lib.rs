//! bzjira - migrate issues from legacy bug trackers into JIRA
//!
//! Pulls issues out of Bugzilla (CGI-era or REST), Mantis (SOAP) or another
//! JIRA instance, and reconciles them into a target JIRA project. Runs are
//! idempotent: every migrated artifact carries a marker derived from its
//! source identity (the external-id custom field, the id suffix in
//! attachment filenames, the `c<id>` tag on comment first lines), and each
//! run re-reads the target and only adds what is missing. There is no local
//! state to lose or corrupt; the target itself is the ledger.

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod reconcile;
pub mod retry;
pub mod source;
pub mod target;

pub use error::{BzJiraError, Result};
