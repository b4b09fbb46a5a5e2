//! Ordered, idempotent deployment steps.
//!
//! A step pairs an optional precondition `check` with an action. The action
//! runs only when the check is unmet (non-zero exit, or no check declared).
//! Execution halts at the first failing step; nothing already applied is
//! undone, and the result lists what completed so the caller can decide what
//! to do with the release.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::run::Cancellation;
use crate::ssh::Session;
use crate::target::Target;
use crate::utils::shell;
use crate::utils::template::{self, TemplateVars};

const OUTPUT_TAIL_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Runs inside the new release before the pointer swap.
    #[default]
    Build,
    /// Runs after the swap (service reloads, cache warmups).
    Activate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Command {
        run: String,
    },
    /// Copy a local file to the target. A relative `to` is resolved against
    /// the release directory.
    Upload {
        from: String,
        to: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub phase: StepPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Step {
    pub fn command(id: &str, run: &str) -> Self {
        Self {
            id: id.to_string(),
            label: None,
            phase: StepPhase::Build,
            check: None,
            action: StepAction::Command {
                run: run.to_string(),
            },
            timeout_secs: None,
        }
    }

    pub fn with_check(mut self, check: &str) -> Self {
        self.check = Some(check.to_string());
        self
    }

    pub fn in_phase(mut self, phase: StepPhase) -> Self {
        self.phase = phase;
        self
    }

    fn templates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.check.iter().map(String::as_str).collect();
        match &self.action {
            StepAction::Command { run } => out.push(run),
            StepAction::Upload { from, to } => {
                out.push(from);
                out.push(to);
            }
        }
        out
    }
}

/// Reject empty or duplicate ids and unknown template placeholders.
pub fn validate_steps(steps: &[Step]) -> Result<()> {
    let mut seen = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(Error::validation_invalid_argument(
                "steps",
                "Step id cannot be empty",
                None,
                None,
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(Error::validation_invalid_argument(
                "steps",
                format!("Duplicate step id '{}'", step.id),
                Some(step.id.clone()),
                None,
            ));
        }
        if let StepAction::Command { run } = &step.action {
            if run.trim().is_empty() {
                return Err(Error::validation_invalid_argument(
                    "steps",
                    format!("Step '{}' has an empty command", step.id),
                    Some(step.id.clone()),
                    None,
                ));
            }
        }
        for text in step.templates() {
            let unknown = template::unknown_placeholders(text, &TemplateVars::ALL);
            if let Some(name) = unknown.first() {
                return Err(Error::validation_invalid_argument(
                    "steps",
                    format!("Step '{}' references unknown variable '{{{{{}}}}}'", step.id, name),
                    Some(step.id.clone()),
                    Some(TemplateVars::ALL.iter().map(|v| v.to_string()).collect()),
                ));
            }
        }
    }
    Ok(())
}

/// Template variables for one target and revision.
pub fn template_vars(target: &Target, revision: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert(TemplateVars::REVISION.to_string(), revision.to_string());
    vars.insert(
        TemplateVars::RELEASE_PATH.to_string(),
        target.release_path(revision),
    );
    vars.insert(TemplateVars::CURRENT_PATH.to_string(), target.current_path());
    vars.insert(TemplateVars::SHARED_PATH.to_string(), target.shared_path());
    vars.insert(
        TemplateVars::DEPLOY_PATH.to_string(),
        target.deploy_root().to_string(),
    );
    vars.insert(TemplateVars::TARGET_ID.to_string(), target.id.clone());
    if let Some(repository) = &target.repository {
        vars.insert(TemplateVars::REPOSITORY.to_string(), repository.clone());
    }
    vars
}

/// Built-in step that fetches `revision` of the target's repository into the
/// release directory. Skipped when the release already holds that commit.
pub fn fetch_step(target: &Target) -> Option<Step> {
    target.repository.as_ref()?;
    let check = "test \"$(git -C {{release_path}} rev-parse HEAD 2>/dev/null)\" = \"$(git -C {{release_path}} rev-parse --verify -q {{revision}}^{commit} 2>/dev/null)\" \
                 && test -n \"$(git -C {{release_path}} rev-parse HEAD 2>/dev/null)\"";
    let run = "git -C {{release_path}} init -q \
               && git -C {{release_path}} fetch -q --depth 1 {{repository}} {{revision}} \
               && git -C {{release_path}} checkout -q --force FETCH_HEAD";
    Some(Step {
        label: Some("Fetch revision".to_string()),
        ..Step::command("fetch", run).with_check(check)
    })
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Precondition unmet; action ran and succeeded.
    Applied,
    /// Precondition already satisfied.
    Skipped,
    Failed,
    /// Not reached because an earlier step failed.
    NotRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub phase: StepPhase,
    pub status: StepStatus,
    /// Rendered action, with no credential material.
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepRunSummary {
    pub total_steps: usize,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_run: usize,
}

/// Outcome of `apply`. `failure` carries the step-wrapped error when a step
/// failed; the results before it are the partial list of completed steps.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    pub steps: Vec<StepResult>,
    pub summary: StepRunSummary,
    #[serde(skip)]
    pub failure: Option<Error>,
}

impl StepRun {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Ids of steps that completed (applied or already satisfied).
    pub fn completed(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Applied | StepStatus::Skipped))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Number of actions that changed the target.
    pub fn mutations(&self) -> usize {
        self.summary.applied
    }

    pub fn into_result(self) -> Result<StepRun> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

fn build_summary(results: &[StepResult]) -> StepRunSummary {
    let count = |status: StepStatus| results.iter().filter(|r| r.status == status).count();
    StepRunSummary {
        total_steps: results.len(),
        applied: count(StepStatus::Applied),
        skipped: count(StepStatus::Skipped),
        failed: count(StepStatus::Failed),
        not_run: count(StepStatus::NotRun),
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Apply `steps` in order against an open session.
pub fn apply(
    session: &dyn Session,
    steps: &[Step],
    vars: &HashMap<String, String>,
    default_timeout: Duration,
) -> StepRun {
    apply_until(session, steps, vars, default_timeout, &Cancellation::new())
}

/// `apply`, checking `cancel` before each step. Steps after a cancellation
/// are reported as not run and `failure` stays empty; the caller decides
/// what a cancelled run means.
pub fn apply_until(
    session: &dyn Session,
    steps: &[Step],
    vars: &HashMap<String, String>,
    default_timeout: Duration,
    cancel: &Cancellation,
) -> StepRun {
    let mut results: Vec<StepResult> = Vec::with_capacity(steps.len());
    let mut failure = None;
    let mut stopped = false;

    for (index, step) in steps.iter().enumerate() {
        if failure.is_none() && !stopped && cancel.is_cancelled() {
            log_status!("step", "Cancelled before {}", step.id);
            stopped = true;
        }
        if failure.is_some() || stopped {
            results.push(not_run(step, vars));
            continue;
        }

        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        let started = Instant::now();

        log_status!("step", "[{}/{}] {}", index + 1, steps.len(), describe(step));

        let mut result = StepResult {
            id: step.id.clone(),
            label: step.label.clone(),
            phase: step.phase,
            status: StepStatus::Failed,
            action: render_action(&step.action, vars),
            exit_code: None,
            stdout: None,
            stderr: None,
            error: None,
            error_code: None,
            duration_ms: 0,
        };

        match run_step(session, step, vars, timeout, &mut result) {
            Ok(status) => {
                result.status = status;
                if status == StepStatus::Skipped {
                    log_status!("step", "{}: already satisfied, skipped", step.id);
                }
            }
            Err(cause) => {
                log_status!("step", "{}: failed: {}", step.id, cause.message);
                result.error = Some(cause.message.clone());
                result.error_code = Some(cause.code.as_str().to_string());
                let completed = results
                    .iter()
                    .filter(|r| matches!(r.status, StepStatus::Applied | StepStatus::Skipped))
                    .map(|r| r.id.clone())
                    .collect();
                failure = Some(Error::step_action_failed(&step.id, index, completed, &cause));
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        results.push(result);
    }

    let summary = build_summary(&results);
    StepRun {
        steps: results,
        summary,
        failure,
    }
}

/// Report every step as satisfied without touching the target. Used when the
/// requested revision is already the active one.
pub fn skip_all(steps: &[Step], vars: &HashMap<String, String>) -> StepRun {
    let results: Vec<StepResult> = steps
        .iter()
        .map(|step| StepResult {
            status: StepStatus::Skipped,
            ..not_run(step, vars)
        })
        .collect();
    let summary = build_summary(&results);
    StepRun {
        steps: results,
        summary,
        failure: None,
    }
}

fn run_step(
    session: &dyn Session,
    step: &Step,
    vars: &HashMap<String, String>,
    timeout: Duration,
    result: &mut StepResult,
) -> Result<StepStatus> {
    if precondition_met(session, step, vars, timeout)? {
        return Ok(StepStatus::Skipped);
    }

    match &step.action {
        StepAction::Command { run } => {
            let command = template::render_shell(run, vars);
            let out = session.run(&command, timeout)?;
            result.exit_code = Some(out.exit_code);
            result.stdout = non_empty(tail(&out.stdout));
            result.stderr = non_empty(tail(&out.stderr));
            out.into_result(&command, session.target())?;
        }
        StepAction::Upload { from, to } => {
            let local = local_path(from, vars);
            let remote = remote_path(to, vars);
            session.copy(&local, &remote, timeout)?;
        }
    }

    Ok(StepStatus::Applied)
}

/// True when the step's desired state already holds.
fn precondition_met(
    session: &dyn Session,
    step: &Step,
    vars: &HashMap<String, String>,
    timeout: Duration,
) -> Result<bool> {
    if let Some(check) = &step.check {
        let command = template::render_shell(check, vars);
        return Ok(session.run(&command, timeout)?.success);
    }

    match &step.action {
        StepAction::Command { .. } => Ok(false),
        StepAction::Upload { from, to } => {
            let local = local_path(from, vars);
            let remote = remote_path(to, vars);
            let local_sum = match file_checksum(&local) {
                Ok(sum) => sum,
                // Let the copy itself report the missing file.
                Err(_) => return Ok(false),
            };
            Ok(remote_checksum(session, &remote, timeout)?.as_deref() == Some(local_sum.as_str()))
        }
    }
}

/// Hex sha256 of a local file.
pub fn file_checksum(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("read {}", path.display())))
    })?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn remote_checksum(session: &dyn Session, path: &str, timeout: Duration) -> Result<Option<String>> {
    let quoted = shell::quote_path(path);
    let command = format!(
        "(sha256sum {p} 2>/dev/null || shasum -a 256 {p} 2>/dev/null) | cut -d' ' -f1",
        p = quoted
    );
    let out = session.run(&command, timeout)?;
    let sum = out.stdout.trim();
    if !out.success || sum.is_empty() {
        return Ok(None);
    }
    Ok(Some(sum.to_string()))
}

fn local_path(from: &str, vars: &HashMap<String, String>) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&template::render(from, vars)).to_string())
}

fn remote_path(to: &str, vars: &HashMap<String, String>) -> String {
    let rendered = template::render(to, vars);
    if rendered.starts_with('/') {
        return rendered;
    }
    match vars.get(TemplateVars::RELEASE_PATH) {
        Some(release) => format!("{}/{}", release.trim_end_matches('/'), rendered),
        None => rendered,
    }
}

fn render_action(action: &StepAction, vars: &HashMap<String, String>) -> String {
    match action {
        StepAction::Command { run } => template::render_shell(run, vars),
        StepAction::Upload { from, to } => format!(
            "upload {} -> {}",
            local_path(from, vars).display(),
            remote_path(to, vars)
        ),
    }
}

fn describe(step: &Step) -> &str {
    step.label.as_deref().unwrap_or(&step.id)
}

fn not_run(step: &Step, vars: &HashMap<String, String>) -> StepResult {
    StepResult {
        id: step.id.clone(),
        label: step.label.clone(),
        phase: step.phase,
        status: StepStatus::NotRun,
        action: render_action(&step.action, vars),
        exit_code: None,
        stdout: None,
        stderr: None,
        error: None,
        error_code: None,
        duration_ms: 0,
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.len() <= OUTPUT_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - OUTPUT_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

// ============================================================================
// Planning
// ============================================================================

/// A step with its templates rendered, for dry runs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub phase: StepPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    pub action: String,
}

pub fn plan(steps: &[Step], vars: &HashMap<String, String>) -> Vec<PlannedStep> {
    steps
        .iter()
        .map(|step| PlannedStep {
            id: step.id.clone(),
            label: step.label.clone(),
            phase: step.phase,
            check: step
                .check
                .as_ref()
                .map(|c| template::render_shell(c, vars))
                .or_else(|| match &step.action {
                    StepAction::Upload { .. } => Some("sha256 comparison".to_string()),
                    StepAction::Command { .. } => None,
                }),
            action: render_action(&step.action, vars),
        })
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::TargetDetails;
    use crate::ssh::LocalSession;

    fn session() -> LocalSession {
        LocalSession::new(TargetDetails::default())
    }

    fn vars(dir: &Path) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert(
            TemplateVars::RELEASE_PATH.to_string(),
            dir.to_string_lossy().to_string(),
        );
        vars.insert(TemplateVars::REVISION.to_string(), "abc123".to_string());
        vars
    }

    #[test]
    fn step_json_shape() {
        let step: Step = serde_json::from_str(
            r#"{"id":"deps","type":"command","run":"composer install","check":"test -d vendor","timeoutSecs":30}"#,
        )
        .unwrap();
        assert_eq!(step.phase, StepPhase::Build);
        assert_eq!(step.timeout_secs, Some(30));
        assert!(matches!(step.action, StepAction::Command { ref run } if run == "composer install"));

        let upload: Step = serde_json::from_str(
            r#"{"id":"env","type":"upload","from":"./.env","to":"{{shared_path}}/.env","phase":"build"}"#,
        )
        .unwrap();
        assert!(matches!(upload.action, StepAction::Upload { .. }));
    }

    #[test]
    fn cancelled_before_start_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![
            Step::command("one", "touch {{release_path}}/one"),
            Step::command("two", "touch {{release_path}}/two"),
        ];
        let cancel = Cancellation::new();
        cancel.cancel();

        let run = apply_until(&session(), &steps, &vars(dir.path()), Duration::from_secs(5), &cancel);
        assert!(run.succeeded());
        assert_eq!(run.summary.not_run, 2);
        assert!(!dir.path().join("one").exists());
    }

    #[test]
    fn satisfied_precondition_skips_action() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let steps = vec![Step::command("touch", "echo x >> {{release_path}}/marker")
            .with_check("test -f {{release_path}}/marker")];

        let first = apply(&session(), &steps, &vars(dir.path()), Duration::from_secs(5));
        assert!(first.succeeded());
        assert_eq!(first.mutations(), 1);

        let second = apply(&session(), &steps, &vars(dir.path()), Duration::from_secs(5));
        assert_eq!(second.steps[0].status, StepStatus::Skipped);
        assert_eq!(second.mutations(), 0);
        assert_eq!(std::fs::read_to_string(marker).unwrap(), "x\n");
    }

    #[test]
    fn halts_at_first_failure_with_partial_results() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![
            Step::command("one", "true"),
            Step::command("two", "true"),
            Step::command("three", "echo broken >&2; exit 3"),
            Step::command("four", "touch {{release_path}}/four"),
        ];

        let run = apply(&session(), &steps, &vars(dir.path()), Duration::from_secs(5));
        assert!(!run.succeeded());
        assert_eq!(run.completed(), vec!["one".to_string(), "two".to_string()]);
        assert_eq!(run.steps[2].status, StepStatus::Failed);
        assert_eq!(run.steps[2].exit_code, Some(3));
        assert_eq!(run.steps[2].stderr.as_deref(), Some("broken"));
        assert_eq!(run.steps[3].status, StepStatus::NotRun);
        assert!(!dir.path().join("four").exists());

        let err = run.failure.unwrap();
        assert_eq!(err.code, crate::ErrorCode::StepActionFailed);
        assert_eq!(err.details["stepId"], "three");
        assert_eq!(err.details["stepIndex"], 2);
        assert_eq!(err.details["causeCode"], "remote.command_failed");
    }

    #[test]
    fn upload_skips_when_checksums_match() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("app.conf");
        std::fs::write(&local, "listen 80;\n").unwrap();
        let release = dir.path().join("release");
        std::fs::create_dir(&release).unwrap();

        let steps = vec![Step {
            id: "conf".to_string(),
            label: None,
            phase: StepPhase::Build,
            check: None,
            action: StepAction::Upload {
                from: local.to_string_lossy().to_string(),
                to: "conf/app.conf".to_string(),
            },
            timeout_secs: None,
        }];

        let first = apply(&session(), &steps, &vars(&release), Duration::from_secs(5));
        assert_eq!(first.steps[0].status, StepStatus::Applied);
        assert_eq!(
            std::fs::read_to_string(release.join("conf/app.conf")).unwrap(),
            "listen 80;\n"
        );

        let second = apply(&session(), &steps, &vars(&release), Duration::from_secs(5));
        assert_eq!(second.steps[0].status, StepStatus::Skipped);
    }

    #[test]
    fn validation_rejects_duplicates_and_unknown_vars() {
        let dup = vec![Step::command("a", "true"), Step::command("a", "true")];
        assert!(validate_steps(&dup).is_err());

        let typo = vec![Step::command("a", "cd {{relase_path}}")];
        let err = validate_steps(&typo).unwrap_err();
        assert!(err.message.contains("relase_path"));

        let ok = vec![Step::command("a", "cd {{release_path}} && make")];
        assert!(validate_steps(&ok).is_ok());
    }

    #[test]
    fn plan_renders_without_executing() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![Step::command("build", "cd {{release_path}} && make {{revision}}")];
        let planned = plan(&steps, &vars(dir.path()));
        assert_eq!(
            planned[0].action,
            format!("cd '{}' && make 'abc123'", dir.path().display())
        );
    }

    #[test]
    fn release_path_with_spaces_and_quotes_stays_one_argument() {
        let dir = tempfile::tempdir().unwrap();
        let release = dir.path().join("it's a release");
        std::fs::create_dir(&release).unwrap();
        let steps = vec![
            Step::command("write", "echo built > {{release_path}}/artifact")
                .with_check("test -f {{release_path}}/artifact"),
        ];

        let run = apply(&session(), &steps, &vars(&release), Duration::from_secs(5));

        assert!(run.succeeded(), "{:?}", run.failure);
        assert_eq!(
            std::fs::read_to_string(release.join("artifact")).unwrap(),
            "built\n"
        );
        assert!(!dir.path().join("it").exists());
    }

    #[test]
    fn fetch_step_quotes_repository_and_release_path() {
        let mut target = crate::target::Target {
            id: "web".to_string(),
            host: "web.example.com".to_string(),
            user: "deploy".to_string(),
            port: 22,
            credential: None,
            deploy_path: "/srv/my app".to_string(),
            branch: None,
            repository: Some("https://git.example.com/app.git".to_string()),
            steps: Vec::new(),
            keep_releases: None,
            reachability: crate::target::Reachability::default(),
        };
        let step = fetch_step(&target).unwrap();
        let planned = plan(&[step], &template_vars(&target, "abc123"));

        assert!(planned[0]
            .action
            .starts_with("git -C '/srv/my app/releases/abc123' init -q"));
        assert!(planned[0]
            .action
            .contains("fetch -q --depth 1 'https://git.example.com/app.git' 'abc123'"));

        target.repository = None;
        assert!(fetch_step(&target).is_none());
    }
}
