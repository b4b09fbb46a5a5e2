use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config;
use crate::credential::{self, CredentialRef};
use crate::error::{Error, Result, TargetDetails};
use crate::paths;
use crate::release::LedgerStore;
use crate::step::{self, Step};
use crate::store;

/// Target ids name files under the state directory (config, ledger, lock).
static TARGET_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(skip_deserializing, default)]
    pub id: String,
    pub host: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,
    /// Remote root holding `releases/`, `shared/` and the `current` link.
    pub deploy_path: String,
    /// Pushes to this branch select the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// When set, a built-in fetch step clones this repository into the release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_releases: Option<usize>,
    #[serde(default)]
    pub reachability: Reachability,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReachabilityState {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reachability {
    pub state: ReachabilityState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl Target {
    /// Derive an id from a host name: `Web01.Example.com` becomes
    /// `web01-example-com`.
    pub fn generate_id(host: &str) -> Result<String> {
        let id = host
            .trim()
            .to_ascii_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        if id.is_empty() {
            return Err(Error::validation_invalid_argument(
                "host",
                "Host must contain at least one letter or number",
                Some(host.to_string()),
                None,
            ));
        }
        Ok(id)
    }

    pub fn details(&self) -> TargetDetails {
        TargetDetails {
            target_id: Some(self.id.clone()),
            host: Some(self.host.clone()),
        }
    }

    pub fn releases_path(&self) -> String {
        format!("{}/releases", self.deploy_root())
    }

    pub fn release_path(&self, revision: &str) -> String {
        format!("{}/releases/{}", self.deploy_root(), revision)
    }

    pub fn current_path(&self) -> String {
        format!("{}/current", self.deploy_root())
    }

    pub fn shared_path(&self) -> String {
        format!("{}/shared", self.deploy_root())
    }

    pub fn deploy_root(&self) -> &str {
        let trimmed = self.deploy_path.trim_end_matches('/');
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    }

    pub fn matches_branch(&self, branch: &str) -> bool {
        self.branch.as_deref() == Some(branch)
    }
}

impl Target {
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;

        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("host".to_string());
        }
        if self.user.trim().is_empty() {
            missing.push("user".to_string());
        }
        if !missing.is_empty() {
            return Err(Error::validation_missing_argument(missing));
        }

        let root = self.deploy_root();
        if !root.starts_with('/') || root == "/" {
            return Err(Error::config_invalid_value(
                "deployPath",
                Some(self.deploy_path.clone()),
                "Deploy path must be an absolute directory other than '/'",
            ));
        }

        if self.keep_releases == Some(0) {
            return Err(Error::config_invalid_value(
                "keepReleases",
                Some("0".to_string()),
                "Must keep at least the active release",
            ));
        }

        step::validate_steps(&self.steps)
    }
}

pub fn validate_id(id: &str) -> Result<()> {
    if TARGET_ID_PATTERN.is_match(id) {
        return Ok(());
    }
    Err(Error::validation_invalid_argument(
        "id",
        "Target id must start with a letter or digit and use only letters, digits, '.', '_' or '-'",
        Some(id.to_string()),
        None,
    ))
}

/// Fields changed by `merge`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetUpdate {
    pub id: String,
    pub updated_fields: Vec<String>,
}

fn from_document(id: &str, document: Value) -> Result<Target> {
    config::reject_plaintext_secrets(&document)?;
    let mut target: Target = serde_json::from_value(document)
        .map_err(|e| Error::validation_invalid_argument("json", e.to_string(), None, None))?;
    target.id = id.to_string();
    Ok(target)
}

pub fn load(id: &str) -> Result<Target> {
    let path = paths::target(id)?;
    match store::read::<Value>(&path)? {
        Some(document) => from_document(id, document),
        None => Err(not_found(id)),
    }
}

/// Every configured target, by id. A config that no longer parses is
/// reported and skipped so the rest stay deployable.
pub fn list() -> Result<Vec<Target>> {
    let mut targets = Vec::new();
    for id in list_ids()? {
        match load(&id) {
            Ok(target) => targets.push(target),
            Err(err) => log_status!("target", "Skipping '{}': {}", id, err.message),
        }
    }
    Ok(targets)
}

pub fn list_ids() -> Result<Vec<String>> {
    store::ids(&paths::targets()?)
}

pub fn save(target: &Target) -> Result<()> {
    target.validate()?;
    store::write(&paths::target(&target.id)?, target)
}

/// Register a target from a JSON spec (`{...}`, `@file`, or `-`).
pub fn create(json_spec: &str) -> Result<Target> {
    let document = config::parse_spec(&config::read_json_spec_to_string(json_spec)?)?;
    let id = document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::validation_missing_argument(vec!["id".to_string()]))?
        .to_string();
    validate_id(&id)?;

    if paths::target(&id)?.exists() {
        return Err(Error::validation_invalid_argument(
            "id",
            format!("Target '{}' already exists", id),
            Some(id),
            None,
        )
        .with_hint("Use 'rollout target set' to change it"));
    }

    let target = from_document(&id, document)?;
    save(&target)?;
    Ok(target)
}

/// Apply a partial JSON update to an existing target. The id comes from the
/// argument or the document's `id` field.
pub fn merge(id: Option<&str>, json_spec: &str) -> Result<TargetUpdate> {
    let mut patch = config::parse_spec(&config::read_json_spec_to_string(json_spec)?)?;
    let id = match id {
        Some(id) => id.to_string(),
        None => patch
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::validation_missing_argument(vec!["id".to_string()]))?,
    };
    if let Some(fields) = patch.as_object_mut() {
        fields.remove("id");
    }

    let mut target = load(&id)?;
    let updated_fields = config::apply_patch(&mut target, patch)?;
    target.id = id.clone();
    save(&target)?;

    Ok(TargetUpdate { id, updated_fields })
}

/// Remove a target with its release ledger and keychain entry. Returns the
/// removed configuration.
pub fn delete(id: &str, ledgers: &LedgerStore) -> Result<Target> {
    let target = load(id)?;
    // Config goes last: a failed cleanup leaves the target in place.
    forget(&target, ledgers, &list()?)?;
    store::remove(&paths::target(id)?)?;
    Ok(target)
}

/// Drop the local state kept for a removed target. A keychain entry still
/// referenced by one of `remaining` is left in place.
pub(crate) fn forget(target: &Target, ledgers: &LedgerStore, remaining: &[Target]) -> Result<()> {
    ledgers.delete(&target.id)?;

    if let Some(CredentialRef::Keychain { entry }) = &target.credential {
        let shared = remaining
            .iter()
            .any(|other| other.id != target.id && other.credential == target.credential);
        if !shared {
            credential::delete(entry)?;
            log_status!("target", "Removed keychain entry '{}'", entry);
        }
    }
    Ok(())
}

pub fn find_by_host(host: &str) -> Option<Target> {
    list().ok()?.into_iter().find(|t| t.host == host)
}

// ============================================================================
// Operations
// ============================================================================

pub fn set_credential(id: &str, credential: Option<CredentialRef>) -> Result<Target> {
    let mut target = load(id)?;
    target.credential = credential;
    save(&target)?;
    Ok(target)
}

/// Persist the outcome of the latest connection attempt.
pub fn record_reachability(id: &str, outcome: &Result<()>) -> Result<Target> {
    let mut target = load(id)?;
    target.reachability = match outcome {
        Ok(()) => Reachability {
            state: ReachabilityState::Reachable,
            checked_at: Some(Utc::now()),
            last_error: None,
        },
        Err(err) if err.code == crate::ErrorCode::SshAuthFailed => Reachability {
            // Host answered; the key was refused.
            state: ReachabilityState::Reachable,
            checked_at: Some(Utc::now()),
            last_error: Some(err.message.clone()),
        },
        Err(err) => Reachability {
            state: ReachabilityState::Unreachable,
            checked_at: Some(Utc::now()),
            last_error: Some(err.message.clone()),
        },
    };
    save(&target)?;
    Ok(target)
}

/// Which targets a deployment applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    Ids(Vec<String>),
    Branch(String),
    All,
}

pub fn select(selector: &TargetSelector) -> Result<Vec<Target>> {
    select_from(list()?, selector, |id| Err(not_found(id)))
}

fn not_found(id: &str) -> Error {
    let known = list_ids().unwrap_or_default();
    Error::target_not_found(id.to_string(), config::similar_ids(id, &known))
}

/// Selection over an explicit target set; unknown ids go through `missing`.
pub fn select_from(
    targets: Vec<Target>,
    selector: &TargetSelector,
    missing: impl Fn(&str) -> Result<Target>,
) -> Result<Vec<Target>> {
    let selected = match selector {
        TargetSelector::All => targets,
        TargetSelector::Branch(branch) => targets
            .into_iter()
            .filter(|t| t.matches_branch(branch))
            .collect(),
        TargetSelector::Ids(ids) => {
            let mut picked = Vec::with_capacity(ids.len());
            for id in ids {
                if picked.iter().any(|t: &Target| &t.id == id) {
                    continue;
                }
                match targets.iter().find(|t| &t.id == id) {
                    Some(t) => picked.push(t.clone()),
                    None => picked.push(missing(id)?),
                }
            }
            picked
        }
    };

    // A push to an untracked branch selects nothing and is not an error.
    if selected.is_empty() && !matches!(selector, TargetSelector::Branch(_)) {
        return Err(Error::validation_invalid_argument(
            "targets",
            "No targets matched the selection",
            None,
            None,
        )
        .with_hint("Register one with 'rollout target create'"));
    }

    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, branch: Option<&str>) -> Target {
        Target {
            id: id.to_string(),
            host: format!("{}.example.com", id),
            user: "deploy".to_string(),
            port: 22,
            credential: None,
            deploy_path: "/srv/app/".to_string(),
            branch: branch.map(String::from),
            repository: None,
            steps: Vec::new(),
            keep_releases: None,
            reachability: Reachability::default(),
        }
    }

    #[test]
    fn layout_paths_hang_off_deploy_root() {
        let t = target("web", None);
        assert_eq!(t.release_path("abc123"), "/srv/app/releases/abc123");
        assert_eq!(t.current_path(), "/srv/app/current");
        assert_eq!(t.shared_path(), "/srv/app/shared");
    }

    #[test]
    fn relative_or_root_deploy_path_is_invalid() {
        let mut t = target("web", None);
        t.deploy_path = "srv/app".to_string();
        assert!(t.validate().is_err());
        t.deploy_path = "/".to_string();
        assert!(t.validate().is_err());
        t.deploy_path = "/srv/app".to_string();
        assert!(t.validate().is_ok());
    }

    #[test]
    fn select_by_branch() {
        let all = vec![target("a", Some("main")), target("b", Some("develop"))];
        let picked = select_from(all, &TargetSelector::Branch("main".into()), |id| {
            Err(Error::target_not_found(id, vec![]))
        })
        .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "a");
    }

    #[test]
    fn select_by_ids_dedupes_and_reports_unknown() {
        let all = vec![target("a", None), target("b", None)];
        let picked = select_from(
            all.clone(),
            &TargetSelector::Ids(vec!["b".into(), "b".into(), "a".into()]),
            |id| Err(Error::target_not_found(id, vec![])),
        )
        .unwrap();
        assert_eq!(
            picked.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );

        let err = select_from(all, &TargetSelector::Ids(vec!["zzz".into()]), |id| {
            Err(Error::target_not_found(id, vec![]))
        })
        .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::TargetNotFound);
    }

    #[test]
    fn no_branch_match_selects_nothing() {
        let all = vec![target("a", Some("main"))];
        let picked = select_from(all.clone(), &TargetSelector::Branch("feature".into()), |id| {
            Err(Error::target_not_found(id, vec![]))
        })
        .unwrap();
        assert!(picked.is_empty());

        assert!(select_from(Vec::new(), &TargetSelector::All, |id| {
            Err(Error::target_not_found(id, vec![]))
        })
        .is_err());
    }

    #[test]
    fn generated_ids_come_from_the_host() {
        assert_eq!(Target::generate_id("Web 01.example.com").unwrap(), "web-01-example-com");
        assert_eq!(Target::generate_id("prod--eu__west").unwrap(), "prod-eu-west");
        assert!(Target::generate_id("!@#$%").is_err());
    }

    #[test]
    fn ids_must_be_safe_file_names() {
        assert!(validate_id("web-01.eu_west").is_ok());
        for bad in ["", "..", ".hidden", "foo/bar", "a\\b", "-web", "web 01"] {
            assert!(validate_id(bad).is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn forgetting_a_target_drops_its_release_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledgers = LedgerStore::new(dir.path());
        let web = target("web", Some("main"));
        ledgers
            .update("web", |ledger| {
                ledger.record_staged("abc123", "/srv/app/releases/abc123");
                ledger.mark_active("abc123", "/srv/app/releases/abc123");
            })
            .unwrap();
        ledgers.update("api", |ledger| ledger.record_staged("abc123", "/srv/api")).unwrap();

        forget(&web, &ledgers, &[]).unwrap();

        assert!(ledgers.load("web").unwrap().releases.is_empty());
        assert!(!dir.path().join("web.json").exists());
        assert_eq!(ledgers.load("api").unwrap().releases.len(), 1);
        forget(&web, &ledgers, &[]).unwrap();
    }
}
