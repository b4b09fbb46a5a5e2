use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    /// Staged, never activated.
    Pending,
    Active,
    Failed,
    /// Was active, superseded by a later activation or rollback.
    Retired,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Active => "active",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Retired => "retired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub revision: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub status: ReleaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
}

impl Release {
    pub fn new(revision: &str, path: &str) -> Self {
        Self {
            revision: revision.to_string(),
            path: path.to_string(),
            created_at: Utc::now(),
            status: ReleaseStatus::Pending,
            activated_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ReleaseStatus::Active
    }
}

static REVISION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,128}$").unwrap());

/// Revisions become directory names on the target: no separators, no
/// traversal, nothing the shell would interpret.
pub fn validate_revision(revision: &str) -> Result<()> {
    if !REVISION_PATTERN.is_match(revision) || revision.starts_with('.') {
        return Err(Error::validation_invalid_argument(
            "revision",
            format!(
                "Invalid revision '{}': use 1-128 letters, digits, '.', '_' or '-', not starting with '.'",
                revision
            ),
            Some(revision.to_string()),
            None,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_shas_and_tags() {
        assert!(validate_revision("abc123").is_ok());
        assert!(validate_revision("v1.4.2").is_ok());
        assert!(validate_revision("0f3e9c1d2b4a").is_ok());
    }

    #[test]
    fn rejects_traversal_and_shell_text() {
        assert!(validate_revision("").is_err());
        assert!(validate_revision("..").is_err());
        assert!(validate_revision("a/b").is_err());
        assert!(validate_revision("x; rm -rf /").is_err());
        assert!(validate_revision(&"a".repeat(129)).is_err());
    }
}
