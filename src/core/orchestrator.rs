//! Drives deployment runs across targets.
//!
//! Per target: acquire the activation lock, connect, stage the release, run
//! build steps, swap `current`, run activate steps. A failure before the swap
//! leaves the previous release serving; a failure after it points `current`
//! back before the run finalizes. A cancelled run stops before its next build
//! step or the swap, whichever comes first. Targets run in parallel, each
//! with its own session.

use std::path::Path;

use serde::Serialize;

use crate::defaults::{self, Defaults};
use crate::error::{Error, Result};
use crate::release::{validate_revision, ActivationLocks, LedgerStore, ReleaseManager, TargetLock};
use crate::run::{Cancellation, DeploymentRun, RunState, RunStore};
use crate::ssh::{DefaultTransport, Session, Transport};
use crate::step::{self, PlannedStep, Step, StepPhase};
use crate::paths;
use crate::target::{self, Target};

pub struct Orchestrator {
    transport: Box<dyn Transport>,
    locks: ActivationLocks,
    ledgers: LedgerStore,
    runs: RunStore,
    defaults: Defaults,
    cancellation: Cancellation,
    record_reachability: bool,
}

impl Orchestrator {
    /// State (ledgers, locks, runs) lives under `state_dir`.
    pub fn new(transport: Box<dyn Transport>, state_dir: &Path, defaults: Defaults) -> Self {
        Self {
            transport,
            locks: ActivationLocks::new(state_dir.join("locks"), &defaults.locks),
            ledgers: LedgerStore::new(state_dir.join("releases")),
            runs: RunStore::new(state_dir.join("runs")),
            defaults,
            cancellation: Cancellation::new(),
            record_reachability: false,
        }
    }

    /// SSH transport, `rollout.json` defaults, state under the config root.
    pub fn from_config() -> Result<Self> {
        let defaults = defaults::load_defaults();
        let transport = Box::new(DefaultTransport::new(defaults.transport.clone()));
        let mut orchestrator = Self::new(transport, &paths::state()?, defaults);
        orchestrator.record_reachability = true;
        Ok(orchestrator)
    }

    pub fn with_lock_wait(mut self, wait: std::time::Duration) -> Self {
        self.locks = self.locks.with_wait(wait);
        self
    }

    /// Handle that stops runs still before their swap.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    pub fn locks(&self) -> &ActivationLocks {
        &self.locks
    }

    pub fn ledgers(&self) -> &LedgerStore {
        &self.ledgers
    }

    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    /// Open a session, recording reachability on the target config.
    pub fn connect(&self, target: &Target) -> Result<Box<dyn Session>> {
        let session = self.transport.connect(target);
        if self.record_reachability {
            let outcome = session.as_ref().map(|_| ()).map_err(|e| e.clone());
            if let Err(err) = target::record_reachability(&target.id, &outcome) {
                log_status!("deploy", "Could not record reachability: {}", err.message);
            }
        }
        session
    }

    /// Deploy `revision` to every target in parallel.
    pub fn deploy(&self, revision: &str, targets: &[Target], trigger: &str) -> OrchestrationResult {
        let runs: Vec<DeploymentRun> = std::thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|target| scope.spawn(move || self.deploy_target(target, revision, trigger)))
                .collect();

            handles
                .into_iter()
                .zip(targets)
                .map(|(handle, target)| {
                    handle.join().unwrap_or_else(|_| {
                        let mut run = DeploymentRun::new(target, revision, trigger);
                        let _ = run.fail(&Error::internal_unexpected("deployment thread panicked"));
                        run
                    })
                })
                .collect()
        });

        OrchestrationResult::new(revision, trigger, runs)
    }

    /// One end-to-end run against one target. Always returns a finalized run;
    /// failures are recorded on it.
    pub fn deploy_target(&self, target: &Target, revision: &str, trigger: &str) -> DeploymentRun {
        let mut run = DeploymentRun::new(target, revision, trigger);
        log_status!(
            "deploy",
            "Run {}: {} -> '{}' ({})",
            run.id,
            revision,
            target.id,
            target.host
        );

        if let Err(err) = self.drive(&mut run, target) {
            if !run.is_finalized() {
                let _ = run.fail(&err);
            }
        }

        match run.state {
            RunState::Active if run.already_active => {
                log_status!("deploy", "'{}' already serves {}; nothing to do", target.id, revision)
            }
            RunState::Active => log_status!("deploy", "'{}' is now serving {}", target.id, revision),
            _ => log_status!(
                "deploy",
                "'{}' failed: {}",
                target.id,
                run.error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown error")
            ),
        }

        if let Err(err) = self.runs.save(&run) {
            log_status!("deploy", "Could not record run {}: {}", run.id, err.message);
        }
        run
    }

    fn drive(&self, run: &mut DeploymentRun, target: &Target) -> Result<()> {
        validate_revision(&run.revision)?;

        let lock = self.locks.acquire(&target.id, &run.id)?;
        let session = self.connect(target)?;
        let timeout = self.defaults.transport.command_timeout();
        let manager = ReleaseManager::new(session.as_ref(), target, &self.ledgers, timeout);
        let vars = step::template_vars(target, &run.revision);
        let (build, activate) = phased_steps(target);

        let previous = manager.current_revision()?;
        if let Some(previous) = &previous {
            manager.sync_active(previous)?;
        }
        run.previous_revision = previous.clone();

        if previous.as_deref() == Some(run.revision.as_str()) {
            run.already_active = true;
            run.release_path = Some(target.release_path(&run.revision));
            run.transition(RunState::Staged)?;
            run.transition(RunState::Activating)?;
            let all: Vec<Step> = build.into_iter().chain(activate).collect();
            run.record_steps(&step::skip_all(&all, &vars));
            return run.succeed();
        }

        if self.cancellation.is_cancelled() {
            return run.fail(&Error::run_cancelled(&target.id, Vec::new()));
        }

        let release = manager.stage(&run.revision)?;
        run.release_path = Some(release.path.clone());
        run.transition(RunState::Staged)?;
        run.transition(RunState::Activating)?;

        let built = step::apply_until(session.as_ref(), &build, &vars, timeout, &self.cancellation);
        run.record_steps(&built);
        let completed = built.completed();
        let built = built.into_result();
        // An interrupt also kills the command in flight, so a step failure
        // seen after cancelling is reported as the cancellation.
        if self.cancellation.is_cancelled() {
            mark_failed(&manager, &run.revision);
            return run.fail(&Error::run_cancelled(&target.id, completed));
        }
        if let Err(err) = built {
            mark_failed(&manager, &run.revision);
            return run.fail(&err);
        }

        if let Err(err) = manager.activate(&lock, &run.revision) {
            mark_failed(&manager, &run.revision);
            return run.fail(&err);
        }
        run.count_mutation();

        let activated = step::apply(session.as_ref(), &activate, &vars, timeout);
        run.record_steps(&activated);
        if let Err(err) = activated.into_result() {
            let err = match manager.restore(&lock, &run.revision, previous.as_deref()) {
                Ok(()) => err,
                Err(restore_err) => err.with_hint(format!(
                    "Restoring the previous release also failed: {}",
                    restore_err.message
                )),
            };
            return run.fail(&err);
        }

        run.succeed()?;
        self.prune_after_success(&manager, &lock, target);
        Ok(())
    }

    fn prune_after_success(&self, manager: &ReleaseManager<'_>, lock: &TargetLock, target: &Target) {
        let keep = target.keep_releases.unwrap_or(self.defaults.releases.keep);
        if let Err(err) = manager.prune(lock, keep) {
            log_status!("deploy", "Pruning old releases on '{}' failed: {}", target.id, err.message);
        }
    }

    /// Render what a deployment would do, without connecting.
    pub fn plan(revision: &str, targets: &[Target]) -> Result<DeployPlan> {
        validate_revision(revision)?;
        let targets = targets
            .iter()
            .map(|target| {
                let vars = step::template_vars(target, revision);
                let (build, activate) = phased_steps(target);
                TargetPlan {
                    target_id: target.id.clone(),
                    host: target.host.clone(),
                    release_path: target.release_path(revision),
                    current_path: target.current_path(),
                    build_steps: step::plan(&build, &vars),
                    swap: format!("{} -> {}", target.current_path(), target.release_path(revision)),
                    activate_steps: step::plan(&activate, &vars),
                }
            })
            .collect();
        Ok(DeployPlan {
            revision: revision.to_string(),
            targets,
        })
    }
}

fn mark_failed(manager: &ReleaseManager<'_>, revision: &str) {
    if let Err(err) = manager.mark_failed(revision) {
        log_status!("deploy", "Could not mark {} failed: {}", revision, err.message);
    }
}

/// Build-phase steps (with the built-in fetch first) and activate-phase steps.
fn phased_steps(target: &Target) -> (Vec<Step>, Vec<Step>) {
    let mut build: Vec<Step> = step::fetch_step(target).into_iter().collect();
    let mut activate = Vec::new();
    for step in &target.steps {
        match step.phase {
            StepPhase::Build => build.push(step.clone()),
            StepPhase::Activate => activate.push(step.clone()),
        }
    }
    (build, activate)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationSummary {
    pub targets: usize,
    pub active: usize,
    pub failed: usize,
    pub mutations: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationResult {
    pub revision: String,
    pub trigger: String,
    pub success: bool,
    pub summary: OrchestrationSummary,
    pub runs: Vec<DeploymentRun>,
}

impl OrchestrationResult {
    fn new(revision: &str, trigger: &str, runs: Vec<DeploymentRun>) -> Self {
        let active = runs.iter().filter(|r| r.state == RunState::Active).count();
        let summary = OrchestrationSummary {
            targets: runs.len(),
            active,
            failed: runs.len() - active,
            mutations: runs.iter().map(|r| r.mutations).sum(),
        };
        Self {
            revision: revision.to_string(),
            trigger: trigger.to_string(),
            success: !runs.is_empty() && active == runs.len(),
            summary,
            runs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetPlan {
    pub target_id: String,
    pub host: String,
    pub release_path: String,
    pub current_path: String,
    pub build_steps: Vec<PlannedStep>,
    pub swap: String,
    pub activate_steps: Vec<PlannedStep>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployPlan {
    pub revision: String,
    pub targets: Vec<TargetPlan>,
}
