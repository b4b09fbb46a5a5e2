//! Inbound deployment triggers.
//!
//! Two payload shapes are accepted:
//!
//! - a push notification: `{"ref": "refs/heads/main", "after": "<sha>"}`;
//!   targets are those whose `branch` matches the pushed branch
//! - an explicit request: `{"revision": "<rev>", "targets": ["web", "db"]}`

use serde::Deserialize;
use serde_json::Value;

use crate::config;
use crate::error::{Error, Result};
use crate::release::validate_revision;
use crate::target::TargetSelector;

const BRANCH_REF_PREFIX: &str = "refs/heads/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRequest {
    pub revision: String,
    pub selector: TargetSelector,
    /// Recorded on every run, e.g. `push:refs/heads/main`.
    pub source: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    #[serde(default, rename = "ref")]
    git_ref: Option<String>,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    revision: Option<String>,
    #[serde(default)]
    targets: Option<Vec<String>>,
    #[serde(default)]
    deleted: bool,
}

/// Parse an event from a JSON spec (`-` for stdin, `@file`, or inline JSON).
pub fn from_spec(spec: &str) -> Result<TriggerRequest> {
    let raw = config::read_json_spec_to_string(spec)?;
    parse_event(&raw)
}

pub fn parse_event(json: &str) -> Result<TriggerRequest> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| Error::validation_invalid_json(e, Some("parse trigger event".to_string())))?;
    let event: RawEvent = serde_json::from_value(value)
        .map_err(|e| Error::validation_invalid_json(e, Some("parse trigger event".to_string())))?;

    let revision = event
        .revision
        .clone()
        .or_else(|| event.after.clone())
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| Error::validation_missing_argument(vec!["revision".to_string()]))?;

    if event.deleted || is_null_sha(&revision) {
        return Err(Error::validation_invalid_argument(
            "after",
            "Event describes a deleted ref; nothing to deploy",
            Some(revision),
            None,
        ));
    }
    validate_revision(&revision)?;

    if let Some(targets) = event.targets.filter(|t| !t.is_empty()) {
        return Ok(TriggerRequest {
            revision,
            selector: TargetSelector::Ids(targets),
            source: "event".to_string(),
        });
    }

    let git_ref = event.git_ref.ok_or_else(|| {
        Error::validation_missing_argument(vec!["ref".to_string(), "targets".to_string()])
    })?;

    let branch = git_ref.strip_prefix(BRANCH_REF_PREFIX).ok_or_else(|| {
        Error::validation_invalid_argument(
            "ref",
            format!("Only branch pushes trigger deployments, got '{}'", git_ref),
            Some(git_ref.clone()),
            None,
        )
    })?;

    Ok(TriggerRequest {
        revision,
        selector: TargetSelector::Branch(branch.to_string()),
        source: format!("push:{}", git_ref),
    })
}

fn is_null_sha(revision: &str) -> bool {
    revision.len() >= 40 && revision.chars().all(|c| c == '0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_event_selects_by_branch() {
        let req = parse_event(
            r#"{"ref":"refs/heads/main","before":"111","after":"9fceb02d0ae598e95dc970b74767f19372d61af8","repository":{"name":"site"}}"#,
        )
        .unwrap();
        assert_eq!(req.revision, "9fceb02d0ae598e95dc970b74767f19372d61af8");
        assert_eq!(req.selector, TargetSelector::Branch("main".to_string()));
        assert_eq!(req.source, "push:refs/heads/main");
    }

    #[test]
    fn explicit_targets_win_over_ref() {
        let req = parse_event(r#"{"revision":"abc123","targets":["web","db"],"ref":"refs/heads/main"}"#)
            .unwrap();
        assert_eq!(
            req.selector,
            TargetSelector::Ids(vec!["web".to_string(), "db".to_string()])
        );
    }

    #[test]
    fn tag_pushes_are_rejected() {
        let err = parse_event(r#"{"ref":"refs/tags/v1","after":"abc123"}"#).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ValidationInvalidArgument);
    }

    #[test]
    fn branch_deletion_is_rejected() {
        let err = parse_event(
            r#"{"ref":"refs/heads/main","after":"0000000000000000000000000000000000000000","deleted":true}"#,
        )
        .unwrap_err();
        assert!(err.message.contains("deleted"));
    }

    #[test]
    fn missing_revision_and_bad_json() {
        assert_eq!(
            parse_event(r#"{"ref":"refs/heads/main"}"#).unwrap_err().code,
            crate::ErrorCode::ValidationMissingArgument
        );
        assert_eq!(
            parse_event("{not json").unwrap_err().code,
            crate::ErrorCode::ValidationInvalidJson
        );
    }

    #[test]
    fn unsafe_revision_is_rejected() {
        assert!(parse_event(r#"{"revision":"../etc","targets":["web"]}"#).is_err());
    }
}
