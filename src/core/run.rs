//! Deployment run records.
//!
//! A run moves `triggered -> staged -> activating -> active | failed`; any
//! non-terminal state may fail. Once terminal the run is finalized, written
//! to `state/runs/<id>.json`, and never changes again.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Hint, Result};
use crate::paths;
use crate::step::{StepResult, StepRun, StepStatus};
use crate::store;
use crate::target::Target;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Triggered,
    Staged,
    Activating,
    Active,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Triggered => "triggered",
            RunState::Staged => "staged",
            RunState::Activating => "activating",
            RunState::Active => "active",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Active | RunState::Failed)
    }

    fn can_transition_to(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Triggered, RunState::Staged)
                | (RunState::Staged, RunState::Activating)
                | (RunState::Activating, RunState::Active)
                | (RunState::Triggered, RunState::Failed)
                | (RunState::Staged, RunState::Failed)
                | (RunState::Activating, RunState::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// Failed after some steps had already been applied.
    Partial,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

/// Serializable snapshot of the error that failed a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<Hint>,
}

impl From<&Error> for RunError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            details: err.details.clone(),
            hints: err.hints.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRun {
    pub id: String,
    pub target_id: String,
    pub host: String,
    pub revision: String,
    /// What started the run, e.g. `cli` or `push:refs/heads/main`.
    pub trigger: String,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_revision: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    /// Actions that changed the target. Zero for a re-run of an active revision.
    #[serde(default)]
    pub mutations: usize,
    #[serde(default)]
    pub already_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub transitions: Vec<Transition>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentRun {
    pub fn new(target: &Target, revision: &str, trigger: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            target_id: target.id.clone(),
            host: target.host.clone(),
            revision: revision.to_string(),
            trigger: trigger.to_string(),
            state: RunState::Triggered,
            outcome: None,
            release_path: None,
            previous_revision: None,
            steps: Vec::new(),
            mutations: 0,
            already_active: false,
            error: None,
            transitions: vec![Transition {
                state: RunState::Triggered,
                at: now,
            }],
            started_at: now,
            finished_at: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::release_invalid_transition(
                self.state.as_str(),
                next.as_str(),
            ));
        }
        let now = Utc::now();
        self.state = next;
        self.transitions.push(Transition { state: next, at: now });
        if next.is_terminal() {
            self.finished_at = Some(now);
            self.outcome = Some(self.derive_outcome());
        }
        Ok(())
    }

    /// Append a step run's results and count its mutations.
    pub fn record_steps(&mut self, run: &StepRun) {
        self.mutations += run.mutations();
        self.steps.extend(run.steps.iter().cloned());
    }

    pub fn count_mutation(&mut self) {
        self.mutations += 1;
    }

    pub fn succeed(&mut self) -> Result<()> {
        self.transition(RunState::Active)
    }

    pub fn fail(&mut self, err: &Error) -> Result<()> {
        self.error = Some(RunError::from(err));
        self.transition(RunState::Failed)
    }

    fn derive_outcome(&self) -> RunOutcome {
        match self.state {
            RunState::Active => RunOutcome::Success,
            _ if self.steps.iter().any(|s| s.status == StepStatus::Applied) => RunOutcome::Partial,
            _ => RunOutcome::Failure,
        }
    }
}

/// Shared stop request for in-flight runs. A run notices it before its next
/// build step and before the swap; once `current` has moved the run finishes.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Finalized runs on disk.
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(paths::runs()?))
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Persist a finalized run. Records are write-once.
    pub fn save(&self, run: &DeploymentRun) -> Result<()> {
        if !run.is_finalized() {
            return Err(Error::release_invalid_transition(run.state.as_str(), "persisted"));
        }
        let path = self.path(&run.id);
        if path.exists() {
            return Err(Error::validation_invalid_argument(
                "run",
                format!("Run '{}' is already recorded", run.id),
                Some(run.id.clone()),
                None,
            ));
        }
        store::write(&path, run)
    }

    pub fn load(&self, id: &str) -> Result<DeploymentRun> {
        if Uuid::parse_str(id).is_err() {
            return Err(Error::run_not_found(id));
        }
        store::read(&self.path(id))?.ok_or_else(|| Error::run_not_found(id))
    }

    /// Newest first, optionally for one target. Unreadable records are skipped.
    pub fn list(&self, target_id: Option<&str>) -> Result<Vec<DeploymentRun>> {
        let mut runs: Vec<DeploymentRun> = store::ids(&self.dir)?
            .iter()
            .filter_map(|id| store::read::<DeploymentRun>(&self.path(id)).ok().flatten())
            .filter(|r| target_id.map_or(true, |id| r.target_id == id))
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepPhase, StepRunSummary};
    use crate::target::Reachability;

    fn target() -> Target {
        Target {
            id: "web".to_string(),
            host: "web.example.com".to_string(),
            user: "deploy".to_string(),
            port: 22,
            credential: None,
            deploy_path: "/srv/app".to_string(),
            branch: None,
            repository: None,
            steps: Vec::new(),
            keep_releases: None,
            reachability: Reachability::default(),
        }
    }

    fn applied(id: &str) -> StepResult {
        StepResult {
            id: id.to_string(),
            label: None,
            phase: StepPhase::Build,
            status: StepStatus::Applied,
            action: "true".to_string(),
            exit_code: Some(0),
            stdout: None,
            stderr: None,
            error: None,
            error_code: None,
            duration_ms: 1,
        }
    }

    #[test]
    fn happy_path_transitions() {
        let mut run = DeploymentRun::new(&target(), "abc123", "cli");
        run.transition(RunState::Staged).unwrap();
        run.transition(RunState::Activating).unwrap();
        run.succeed().unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Success));
        assert!(run.finished_at.is_some());
        assert_eq!(run.transitions.len(), 4);
    }

    #[test]
    fn finalized_runs_are_immutable() {
        let mut run = DeploymentRun::new(&target(), "abc123", "cli");
        run.fail(&Error::ssh_timeout(Default::default(), 3)).unwrap();
        let err = run.transition(RunState::Staged).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ReleaseInvalidTransition);
        assert!(run.succeed().is_err());
    }

    #[test]
    fn cancelling_any_clone_reaches_every_holder() {
        let cancel = Cancellation::new();
        let handed_out = cancel.clone();
        assert!(!handed_out.is_cancelled());
        std::thread::spawn(move || cancel.cancel()).join().unwrap();
        assert!(handed_out.is_cancelled());
    }

    #[test]
    fn skipping_staged_is_rejected() {
        let mut run = DeploymentRun::new(&target(), "abc123", "cli");
        assert!(run.transition(RunState::Activating).is_err());
    }

    #[test]
    fn failure_after_applied_steps_is_partial() {
        let mut run = DeploymentRun::new(&target(), "abc123", "cli");
        run.record_steps(&StepRun {
            steps: vec![applied("one")],
            summary: StepRunSummary {
                total_steps: 1,
                applied: 1,
                skipped: 0,
                failed: 0,
                not_run: 0,
            },
            failure: None,
        });
        run.transition(RunState::Staged).unwrap();
        run.fail(&Error::internal_unexpected("boom")).unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Partial));
        assert_eq!(run.mutations, 1);
    }

    #[test]
    fn store_is_write_once_and_lists_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());

        let mut first = DeploymentRun::new(&target(), "abc123", "cli");
        first.fail(&Error::internal_unexpected("x")).unwrap();
        store.save(&first).unwrap();
        assert!(store.save(&first).is_err());

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut second = DeploymentRun::new(&target(), "def456", "cli");
        second.fail(&Error::internal_unexpected("y")).unwrap();
        store.save(&second).unwrap();

        let runs = store.list(Some("web")).unwrap();
        assert_eq!(runs[0].revision, "def456");
        assert!(store.list(Some("db")).unwrap().is_empty());
        assert_eq!(store.load(&first.id).unwrap().revision, "abc123");
    }

    #[test]
    fn unfinished_runs_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let run = DeploymentRun::new(&target(), "abc123", "cli");
        assert!(RunStore::new(dir.path()).save(&run).is_err());
    }

    #[test]
    fn unknown_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        assert_eq!(
            store.load("not-a-uuid").unwrap_err().code,
            crate::ErrorCode::RunNotFound
        );
        assert_eq!(
            store.load(&Uuid::new_v4().to_string()).unwrap_err().code,
            crate::ErrorCode::RunNotFound
        );
    }
}
