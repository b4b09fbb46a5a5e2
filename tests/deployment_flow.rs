#![cfg(target_os = "linux")]

use std::path::Path;
use std::time::Duration;

use rollout::defaults::Defaults;
use rollout::orchestrator::Orchestrator;
use rollout::release::{ReleaseManager, ReleaseStatus};
use rollout::run::{RunOutcome, RunState};
use rollout::ssh::LocalTransport;
use rollout::step::{Step, StepPhase, StepStatus};
use rollout::target::{Reachability, Target};
use rollout::ErrorCode;

fn target(id: &str, root: &Path, steps: Vec<Step>) -> Target {
    Target {
        id: id.to_string(),
        host: "localhost".to_string(),
        user: "deploy".to_string(),
        port: 22,
        credential: None,
        deploy_path: root.join(id).to_string_lossy().to_string(),
        branch: Some("main".to_string()),
        repository: None,
        steps,
        keep_releases: None,
        reachability: Reachability::default(),
    }
}

fn orchestrator(state: &Path) -> Orchestrator {
    Orchestrator::new(Box::new(LocalTransport), state, Defaults::default())
}

fn current_of(t: &Target) -> String {
    std::fs::read_link(t.current_path())
        .unwrap()
        .to_string_lossy()
        .to_string()
}

#[test]
fn failed_step_three_leaves_abc123_serving() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(&dir.path().join("state"));

    let first = target("web", dir.path(), vec![Step::command("build", "true")]);
    assert_eq!(o.deploy_target(&first, "abc123", "cli").state, RunState::Active);

    let second = target(
        "web",
        dir.path(),
        vec![
            Step::command("install", "touch {{release_path}}/installed"),
            Step::command("link-shared", "ln -sfn {{shared_path}} {{release_path}}/shared"),
            Step::command("migrate", "exit 3"),
            Step::command("warm", "touch {{release_path}}/warm"),
        ],
    );
    let run = o.deploy_target(&second, "def456", "cli");

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.outcome, Some(RunOutcome::Partial));
    let statuses: Vec<StepStatus> = run.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Applied,
            StepStatus::Applied,
            StepStatus::Failed,
            StepStatus::NotRun
        ]
    );
    assert_eq!(current_of(&first), first.release_path("abc123"));
    assert!(!Path::new(&second.release_path("def456")).join("warm").exists());

    let ledger = o.ledgers().load("web").unwrap();
    assert_eq!(ledger.active.as_deref(), Some("abc123"));
    assert_eq!(ledger.get("def456").unwrap().status, ReleaseStatus::Failed);

    let saved = o.runs().load(&run.id).unwrap();
    assert_eq!(saved.state, RunState::Failed);
    assert_eq!(saved.steps.len(), 4);
}

#[test]
fn rollback_returns_to_previous_release() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(&dir.path().join("state"));
    let t = target("web", dir.path(), vec![]);

    assert_eq!(o.deploy_target(&t, "abc123", "cli").state, RunState::Active);
    assert_eq!(o.deploy_target(&t, "def456", "cli").state, RunState::Active);
    assert_eq!(current_of(&t), t.release_path("def456"));

    let lock = o.locks().acquire("web", "rollback-test").unwrap();
    let session = o.connect(&t).unwrap();
    let manager = ReleaseManager::new(session.as_ref(), &t, o.ledgers(), Duration::from_secs(10));

    let restored = manager.rollback(&lock).unwrap();
    assert_eq!(restored.revision, "abc123");
    assert_eq!(current_of(&t), t.release_path("abc123"));
    assert_eq!(manager.current_revision().unwrap().as_deref(), Some("abc123"));
}

#[test]
fn rollback_without_history_is_no_prior_release() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(&dir.path().join("state"));
    let t = target("web", dir.path(), vec![]);
    assert_eq!(o.deploy_target(&t, "abc123", "cli").state, RunState::Active);

    let lock = o.locks().acquire("web", "rollback-test").unwrap();
    let session = o.connect(&t).unwrap();
    let manager = ReleaseManager::new(session.as_ref(), &t, o.ledgers(), Duration::from_secs(10));

    let err = manager.rollback(&lock).unwrap_err();
    assert_eq!(err.code, ErrorCode::ReleaseNoPrior);
    assert_eq!(current_of(&t), t.release_path("abc123"));
}

#[test]
fn concurrent_runs_on_one_target_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(&dir.path().join("state"));
    let slow = target("web", dir.path(), vec![Step::command("build", "sleep 0.5")]);

    let (a, b) = std::thread::scope(|scope| {
        let a = scope.spawn(|| o.deploy_target(&slow, "abc123", "cli"));
        let b = scope.spawn(|| o.deploy_target(&slow, "def456", "cli"));
        (a.join().unwrap(), b.join().unwrap())
    });

    let runs = [a, b];
    let active = runs.iter().filter(|r| r.state == RunState::Active).count();
    let conflicts = runs
        .iter()
        .filter(|r| r.error.as_ref().map(|e| e.code.as_str()) == Some("release.conflict"))
        .count();
    assert_eq!(active, 1);
    assert_eq!(conflicts, 1);
}

#[test]
fn checked_steps_skip_on_rerun_of_new_release() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(&dir.path().join("state"));
    let marker = dir.path().join("shared-ready");
    let t = target(
        "web",
        dir.path(),
        vec![
            Step::command("prepare-shared", &format!("touch {}", marker.display()))
                .with_check(&format!("test -f {}", marker.display())),
            Step::command("reload", "true").in_phase(StepPhase::Activate),
        ],
    );

    let first = o.deploy_target(&t, "abc123", "cli");
    assert_eq!(first.steps[0].status, StepStatus::Applied);

    let second = o.deploy_target(&t, "def456", "cli");
    assert_eq!(second.state, RunState::Active);
    assert_eq!(second.steps[0].status, StepStatus::Skipped);
    assert_eq!(second.steps[1].status, StepStatus::Applied);
}

#[test]
fn old_releases_are_pruned_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let o = orchestrator(&dir.path().join("state"));
    let mut t = target("web", dir.path(), vec![]);
    t.keep_releases = Some(2);

    for rev in ["r1", "r2", "r3", "r4"] {
        assert_eq!(o.deploy_target(&t, rev, "cli").state, RunState::Active);
    }

    assert!(!Path::new(&t.release_path("r1")).exists());
    assert!(!Path::new(&t.release_path("r2")).exists());
    assert!(Path::new(&t.release_path("r3")).exists());
    assert_eq!(current_of(&t), t.release_path("r4"));
}
