//! Accounts file
//!
//! One JSON object per line: `{"email": "...", "k2_password": "..."}`. Blank
//! lines and lines that do not parse or lack either field are skipped, so a
//! half-edited file still yields every usable account.

use std::path::Path;

use common::Secret;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Account {
    pub email: String,
    pub password: Secret<String>,
}

#[derive(Deserialize)]
struct AccountLine {
    email: String,
    k2_password: String,
}

/// Parse accounts-file contents, preserving line order.
pub fn parse_accounts(contents: &str) -> Vec<Account> {
    contents
        .lines()
        .enumerate()
        .filter_map(|(n, line)| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            match serde_json::from_str::<AccountLine>(line) {
                Ok(parsed) => Some(Account {
                    email: parsed.email,
                    password: Secret::new(parsed.k2_password),
                }),
                Err(e) => {
                    debug!(line = n + 1, error = %e, "skipping malformed account line");
                    None
                }
            }
        })
        .collect()
}

pub async fn load_accounts(path: &Path) -> Result<Vec<Account>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io(format!("reading accounts file {}: {e}", path.display())))?;
    let accounts = parse_accounts(&contents);
    info!(path = %path.display(), accounts = accounts.len(), "loaded accounts");
    Ok(accounts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_valid_lines_in_order() {
        let contents = concat!(
            "{\"email\": \"a@example.com\", \"k2_password\": \"pa\"}\n",
            "\n",
            "not json\n",
            "{\"email\": \"missing-password@example.com\"}\n",
            "  {\"email\": \"b@example.com\", \"k2_password\": \"pb\", \"note\": 1}  \n",
        );
        let accounts = parse_accounts(contents);
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].email, "a@example.com");
        assert_eq!(accounts[0].password.expose(), "pa");
        assert_eq!(accounts[1].email, "b@example.com");
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let accounts = parse_accounts("{\"email\": \"a@x\", \"k2_password\": \"hunter2\"}");
        let debug = format!("{:?}", accounts[0]);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"email\": \"a@x\", \"k2_password\": \"p\"}}").unwrap();

        let accounts = load_accounts(file.path()).await.unwrap();
        assert_eq!(accounts.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_accounts(&dir.path().join("nope.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
