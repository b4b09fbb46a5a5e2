//! Per-target release history, persisted as `state/releases/<target>.json`.
//!
//! The `current` symlink on the target is the source of truth for what is
//! served; the ledger records statuses and the activation history that
//! rollback walks back through.

use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::types::{Release, ReleaseStatus};
use crate::error::Result;
use crate::paths;
use crate::store;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub target_id: String,
    #[serde(default)]
    pub releases: Vec<Release>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
    /// Previously active revisions, most recent last.
    #[serde(default)]
    pub history: Vec<String>,
}

impl Ledger {
    pub fn new(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            ..Default::default()
        }
    }

    pub fn get(&self, revision: &str) -> Option<&Release> {
        self.releases.iter().find(|r| r.revision == revision)
    }

    fn get_mut(&mut self, revision: &str) -> Option<&mut Release> {
        self.releases.iter_mut().find(|r| r.revision == revision)
    }

    /// Record a staged release. Re-staging keeps the original creation time;
    /// a previously failed revision goes back to pending.
    pub fn record_staged(&mut self, revision: &str, path: &str) -> Release {
        match self.get_mut(revision) {
            Some(existing) => {
                if existing.status == ReleaseStatus::Failed {
                    existing.status = ReleaseStatus::Pending;
                }
                existing.path = path.to_string();
                existing.clone()
            }
            None => {
                let release = Release::new(revision, path);
                self.releases.push(release.clone());
                release
            }
        }
    }

    /// Make `revision` the single active release. The previous one is
    /// retired and pushed onto the history.
    pub fn mark_active(&mut self, revision: &str, path: &str) -> Release {
        if self.active.as_deref() == Some(revision) {
            if let Some(release) = self.get(revision) {
                return release.clone();
            }
        }

        if let Some(previous) = self.active.take() {
            if let Some(release) = self.get_mut(&previous) {
                release.status = ReleaseStatus::Retired;
            }
            self.history.retain(|r| r != &previous);
            self.history.push(previous);
        }

        if self.get(revision).is_none() {
            self.releases.push(Release::new(revision, path));
        }
        self.history.retain(|r| r != revision);

        let now = Utc::now();
        let mut activated = None;
        for release in self.releases.iter_mut() {
            if release.revision == revision {
                release.status = ReleaseStatus::Active;
                release.activated_at = Some(now);
                activated = Some(release.clone());
            } else if release.status == ReleaseStatus::Active {
                release.status = ReleaseStatus::Retired;
            }
        }
        self.active = Some(revision.to_string());
        activated.unwrap_or_else(|| Release::new(revision, path))
    }

    /// Most recent previously active release still eligible as a rollback
    /// destination.
    pub fn rollback_candidates(&self) -> Vec<&Release> {
        self.history
            .iter()
            .rev()
            .filter_map(|rev| self.get(rev))
            .filter(|r| r.status == ReleaseStatus::Retired)
            .collect()
    }

    /// Repoint to `revision` taken from the history. Everything newer than it
    /// in the history is dropped, and the release rolled away from is retired.
    pub fn mark_rolled_back(&mut self, revision: &str) -> Option<Release> {
        let position = self.history.iter().rposition(|r| r == revision)?;
        self.history.truncate(position);

        if let Some(current) = self.active.take() {
            if let Some(release) = self.get_mut(&current) {
                release.status = ReleaseStatus::Retired;
            }
        }

        let release = self.get_mut(revision)?;
        release.status = ReleaseStatus::Active;
        release.activated_at = Some(Utc::now());
        let release = release.clone();
        self.active = Some(revision.to_string());
        Some(release)
    }

    pub fn mark_failed(&mut self, revision: &str) {
        if let Some(release) = self.get_mut(revision) {
            release.status = ReleaseStatus::Failed;
        }
        if self.active.as_deref() == Some(revision) {
            self.active = None;
        }
        self.history.retain(|r| r != revision);
    }

    /// Clear the active pointer without a replacement (first deploy undone).
    pub fn clear_active(&mut self) {
        self.active = None;
    }

    pub fn remove(&mut self, revision: &str) {
        self.releases.retain(|r| r.revision != revision);
        self.history.retain(|r| r != revision);
        if self.active.as_deref() == Some(revision) {
            self.active = None;
        }
    }

    /// Releases sorted newest first.
    pub fn newest_first(&self) -> Vec<Release> {
        let mut releases = self.releases.clone();
        releases.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        releases
    }
}

/// Ledger files under a state directory.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    dir: PathBuf,
}

impl LedgerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(paths::ledgers()?))
    }

    fn path(&self, target_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", target_id))
    }

    pub fn load(&self, target_id: &str) -> Result<Ledger> {
        let mut ledger = store::read::<Ledger>(&self.path(target_id))?
            .unwrap_or_else(|| Ledger::new(target_id));
        ledger.target_id = target_id.to_string();
        Ok(ledger)
    }

    pub fn save(&self, ledger: &Ledger) -> Result<()> {
        store::write(&self.path(&ledger.target_id), ledger)
    }

    /// Load, mutate and save in one step.
    pub fn update<T>(&self, target_id: &str, f: impl FnOnce(&mut Ledger) -> T) -> Result<T> {
        let mut ledger = self.load(target_id)?;
        let value = f(&mut ledger);
        self.save(&ledger)?;
        Ok(value)
    }

    /// Forget a target's history entirely.
    pub fn delete(&self, target_id: &str) -> Result<()> {
        store::remove(&self.path(target_id)).map(|_| ())
    }
}
