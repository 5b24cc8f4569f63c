//! Credential resolution
//!
//! Credentials are looked up in `~/.netrc` by host, falling back to an
//! interactive prompt in the driver. No credentials are ever written to
//! disk by this tool.

use crate::{BzJiraError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A username/password pair for one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Extract the host portion of a service URL for the .netrc lookup
pub fn host_of(url: &str) -> Result<String> {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let host = rest
        .split(['/', '?'])
        .next()
        .unwrap_or_default()
        .split('@')
        .next_back()
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default();
    if host.is_empty() {
        return Err(BzJiraError::Config(format!("no host in URL {:?}", url)));
    }
    Ok(host.to_string())
}

fn netrc_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".netrc"))
}

/// Look up credentials for a host in the user's .netrc, if it exists.
/// A missing or unreadable file is not an error; the caller prompts.
pub fn netrc_credentials(host: &str) -> Option<Credentials> {
    let path = netrc_path()?;
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let found = parse_netrc(&content, host);
            if found.is_some() {
                debug!(host = %host, path = %path.display(), "Credentials found in .netrc");
            }
            found
        }
        Err(_) => None,
    }
}

/// Same lookup against an explicit file, for tests and overrides
pub fn netrc_credentials_from(path: &Path, host: &str) -> Option<Credentials> {
    let content = std::fs::read_to_string(path).ok()?;
    parse_netrc(&content, host)
}

/// Minimal .netrc parser: `machine`/`default` entries with `login` and
/// `password` tokens. `macdef` blocks (which run to a blank line) are
/// skipped. The first matching machine wins; `default` applies when no
/// machine matched, per netrc(5).
fn parse_netrc(content: &str, host: &str) -> Option<Credentials> {
    let mut machine_match: Option<Credentials> = None;
    let mut default_match: Option<Credentials> = None;

    // current entry state
    let mut in_entry = false;
    let mut is_default = false;
    let mut login: Option<String> = None;
    let mut password: Option<String> = None;
    let mut in_macdef = false;

    let mut finish =
        |is_default: bool, login: &mut Option<String>, password: &mut Option<String>,
         machine_match: &mut Option<Credentials>, default_match: &mut Option<Credentials>| {
            if let (Some(l), Some(p)) = (login.take(), password.take()) {
                let creds = Credentials { username: l, password: p };
                if is_default {
                    default_match.get_or_insert(creds);
                } else {
                    machine_match.get_or_insert(creds);
                }
            }
        };

    for line in content.lines() {
        if in_macdef {
            if line.trim().is_empty() {
                in_macdef = false;
            }
            continue;
        }

        let mut tokens = line.split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            match token {
                "machine" => {
                    if in_entry {
                        finish(is_default, &mut login, &mut password,
                               &mut machine_match, &mut default_match);
                    }
                    let name = tokens.next().unwrap_or_default();
                    in_entry = name == host;
                    is_default = false;
                }
                "default" => {
                    if in_entry {
                        finish(is_default, &mut login, &mut password,
                               &mut machine_match, &mut default_match);
                    }
                    in_entry = true;
                    is_default = true;
                }
                "login" if in_entry => {
                    login = tokens.next().map(str::to_string);
                }
                "password" if in_entry => {
                    password = tokens.next().map(str::to_string);
                }
                "macdef" => {
                    in_macdef = true;
                    break;
                }
                _ => {}
            }
        }
    }
    if in_entry {
        finish(is_default, &mut login, &mut password,
               &mut machine_match, &mut default_match);
    }

    machine_match.or(default_match)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_extraction() {
        assert_eq!(host_of("https://jira.example.com/").unwrap(), "jira.example.com");
        assert_eq!(host_of("http://bz.example.com:8080/tracker").unwrap(), "bz.example.com");
        assert_eq!(host_of("https://user@jira.example.com/browse?x=1").unwrap(), "jira.example.com");
        assert!(host_of("").is_err());
    }

    #[test]
    fn test_netrc_machine_entry() {
        let content = "machine jira.example.com login alice password s3cret\n\
                       machine other.example.com login bob password hunter2\n";
        let creds = parse_netrc(content, "jira.example.com").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "s3cret");

        let creds = parse_netrc(content, "other.example.com").unwrap();
        assert_eq!(creds.username, "bob");
    }

    #[test]
    fn test_netrc_multiline_entry() {
        let content = "machine jira.example.com\n  login alice\n  password s3cret\n";
        let creds = parse_netrc(content, "jira.example.com").unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "s3cret");
    }

    #[test]
    fn test_netrc_default_fallback() {
        let content = "machine other.example.com login bob password hunter2\n\
                       default login guest password anon\n";
        let creds = parse_netrc(content, "jira.example.com").unwrap();
        assert_eq!(creds.username, "guest");

        // A machine match beats the default
        let creds = parse_netrc(content, "other.example.com").unwrap();
        assert_eq!(creds.username, "bob");
    }

    #[test]
    fn test_netrc_no_match() {
        let content = "machine other.example.com login bob password hunter2\n";
        assert!(parse_netrc(content, "jira.example.com").is_none());
    }

    #[test]
    fn test_netrc_macdef_skipped() {
        let content = "macdef init\n  touch /tmp/x\n\n\
                       machine jira.example.com login alice password s3cret\n";
        let creds = parse_netrc(content, "jira.example.com").unwrap();
        assert_eq!(creds.username, "alice");
    }

    #[test]
    fn test_netrc_file_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netrc");
        std::fs::write(&path, "machine h.example.com login x password y\n").unwrap();
        let creds = netrc_credentials_from(&path, "h.example.com").unwrap();
        assert_eq!(creds, Credentials { username: "x".to_string(), password: "y".to_string() });
    }
}
