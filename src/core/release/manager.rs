use std::time::Duration;

use super::ledger::LedgerStore;
use super::lock::TargetLock;
use super::types::{validate_revision, Release, ReleaseStatus};
use crate::error::{Error, Result};
use crate::ssh::Session;
use crate::target::Target;
use crate::utils::shell;

/// Release directories and the `current` pointer on one target, over an
/// open session.
///
/// Layout under the deploy root:
///
/// ```text
/// releases/<revision>/   one directory per staged revision
/// shared/                persistent files shared across releases
/// current -> releases/<revision>
/// ```
pub struct ReleaseManager<'a> {
    session: &'a dyn Session,
    target: &'a Target,
    ledgers: &'a LedgerStore,
    timeout: Duration,
}

impl<'a> ReleaseManager<'a> {
    pub fn new(
        session: &'a dyn Session,
        target: &'a Target,
        ledgers: &'a LedgerStore,
        timeout: Duration,
    ) -> Self {
        Self {
            session,
            target,
            ledgers,
            timeout,
        }
    }

    fn run_checked(&self, command: &str) -> Result<String> {
        Ok(self.session.run_checked(command, self.timeout)?.stdout)
    }

    fn dir_exists(&self, path: &str) -> Result<bool> {
        let command = format!("test -d {}", shell::quote_path(path));
        Ok(self.session.run(&command, self.timeout)?.success)
    }

    /// Create the release directory for `revision` (inactive). Reuses an
    /// existing directory for the same revision.
    pub fn stage(&self, revision: &str) -> Result<Release> {
        validate_revision(revision)?;
        let release_path = self.target.release_path(revision);

        let command = format!(
            "mkdir -p {} {}",
            shell::quote_path(&release_path),
            shell::quote_path(&self.target.shared_path())
        );
        self.run_checked(&command)?;

        if !self.dir_exists(&release_path)? {
            return Err(Error::release_not_found(&self.target.id, revision));
        }

        log_status!("release", "Staged {} on '{}'", revision, self.target.id);
        self.ledgers
            .update(&self.target.id, |l| l.record_staged(revision, &release_path))
    }

    /// Revision the `current` link points at, read from the target.
    pub fn current_revision(&self) -> Result<Option<String>> {
        let command = format!(
            "readlink {} || true",
            shell::quote_path(&self.target.current_path())
        );
        let link = self.run_checked(&command)?;
        let link = link.trim().trim_end_matches('/');
        if link.is_empty() {
            return Ok(None);
        }

        let releases = format!("{}/", self.target.releases_path());
        let revision = link
            .strip_prefix(&releases)
            .or_else(|| link.strip_prefix("releases/"))
            .unwrap_or(link);
        Ok(revision.rsplit('/').next().map(str::to_string))
    }

    /// Atomically repoint `current` at `revision`. Requires the target's
    /// activation lock.
    pub fn activate(&self, lock: &TargetLock, revision: &str) -> Result<Release> {
        lock.ensure_for(&self.target.id)?;
        validate_revision(revision)?;

        let release_path = self.target.release_path(revision);
        if !self.dir_exists(&release_path)? {
            return Err(Error::release_not_found(&self.target.id, revision));
        }

        self.swap(&release_path)?;
        log_status!("release", "Activated {} on '{}'", revision, self.target.id);
        self.ledgers
            .update(&self.target.id, |l| l.mark_active(revision, &release_path))
    }

    /// Repoint `current` at the previously active release.
    pub fn rollback(&self, lock: &TargetLock) -> Result<Release> {
        lock.ensure_for(&self.target.id)?;

        // The link may have been moved outside rollout; never pick what is
        // already served.
        let served = self.current_revision()?;
        if let Some(served) = &served {
            self.sync_active(served)?;
        }

        let ledger = self.ledgers.load(&self.target.id)?;
        let candidates: Vec<Release> = ledger.rollback_candidates().into_iter().cloned().collect();

        for candidate in candidates {
            if served.as_deref() == Some(candidate.revision.as_str()) {
                continue;
            }
            if !self.dir_exists(&candidate.path)? {
                log_status!(
                    "release",
                    "Skipping {}: release directory is gone",
                    candidate.revision
                );
                continue;
            }
            self.swap(&candidate.path)?;
            log_status!(
                "release",
                "Rolled back '{}' to {}",
                self.target.id,
                candidate.revision
            );
            return self
                .ledgers
                .update(&self.target.id, |l| l.mark_rolled_back(&candidate.revision))?
                .ok_or_else(|| Error::release_no_prior(&self.target.id));
        }

        Err(Error::release_no_prior(&self.target.id))
    }

    /// Undo a swap to `failed` after a post-activation failure: point back at
    /// `previous`, or drop the link if there was none. `failed` is marked
    /// failed either way.
    pub fn restore(&self, lock: &TargetLock, failed: &str, previous: Option<&str>) -> Result<()> {
        lock.ensure_for(&self.target.id)?;

        match previous {
            Some(previous) => {
                self.swap(&self.target.release_path(previous))?;
                log_status!(
                    "release",
                    "Restored '{}' to {}",
                    self.target.id,
                    previous
                );
            }
            None => {
                let command = format!("rm -f {}", shell::quote_path(&self.target.current_path()));
                self.run_checked(&command)?;
            }
        }

        self.ledgers.update(&self.target.id, |l| {
            if let Some(previous) = previous {
                if l.mark_rolled_back(previous).is_none() {
                    let path = self.target.release_path(previous);
                    l.mark_active(previous, &path);
                }
            } else {
                l.clear_active();
            }
            l.mark_failed(failed);
        })
    }

    pub fn mark_failed(&self, revision: &str) -> Result<()> {
        self.ledgers
            .update(&self.target.id, |l| l.mark_failed(revision))
    }

    /// Bring the ledger in line with what the target actually serves.
    pub fn sync_active(&self, revision: &str) -> Result<()> {
        let path = self.target.release_path(revision);
        self.ledgers.update(&self.target.id, |l| {
            if l.active.as_deref() != Some(revision) {
                l.mark_active(revision, &path);
            }
        })
    }

    /// Delete retired and failed releases beyond the newest `keep` releases.
    /// The active release always survives and counts toward `keep`.
    pub fn prune(&self, lock: &TargetLock, keep: usize) -> Result<Vec<String>> {
        lock.ensure_for(&self.target.id)?;

        let current = self.current_revision()?;
        let ledger = self.ledgers.load(&self.target.id)?;
        let mut kept = 0usize;
        let mut doomed = Vec::new();

        for release in ledger.newest_first() {
            let is_current = current.as_deref() == Some(release.revision.as_str());
            if is_current || release.is_active() || release.status == ReleaseStatus::Pending {
                kept += 1;
                continue;
            }
            if kept < keep {
                kept += 1;
                continue;
            }
            doomed.push(release);
        }

        let mut removed = Vec::new();
        for release in doomed {
            let command = format!("rm -rf {}", shell::quote_path(&release.path));
            self.run_checked(&command)?;
            self.ledgers
                .update(&self.target.id, |l| l.remove(&release.revision))?;
            log_status!("release", "Pruned {} on '{}'", release.revision, self.target.id);
            removed.push(release.revision);
        }

        Ok(removed)
    }

    /// Symlink to a temp name, then rename over `current`. `mv -T` renames
    /// the link itself instead of moving into the directory it points at, so
    /// readers see either the old or the new target, never neither.
    fn swap(&self, release_path: &str) -> Result<()> {
        let current = self.target.current_path();
        let tmp = format!("{}/.current.{}", self.target.deploy_root(), std::process::id());
        let command = format!(
            "ln -sfn {release} {tmp} && mv -Tf {tmp} {current}",
            release = shell::quote_path(release_path),
            tmp = shell::quote_path(&tmp),
            current = shell::quote_path(&current),
        );
        self.run_checked(&command).map(|_| ())
    }
}

pub fn list(ledgers: &LedgerStore, target_id: &str) -> Result<Vec<Release>> {
    Ok(ledgers.load(target_id)?.newest_first())
}
