use std::time::Duration;

use clap::Args;
use serde::Serialize;

use rollout::log_status;
use rollout::orchestrator::{DeployPlan, OrchestrationResult, Orchestrator};
use rollout::run::Cancellation;
use rollout::target::{self, Target, TargetSelector};

use super::CmdResult;

#[derive(Args)]
pub struct DeployArgs {
    /// Revision to deploy (commit SHA, tag or build id)
    pub revision: String,

    /// Target ID (repeatable)
    #[arg(long = "target", short = 't', conflicts_with_all = ["branch", "all"])]
    pub targets: Vec<String>,

    /// Deploy to every target tracking this branch
    #[arg(long, conflicts_with = "all")]
    pub branch: Option<String>,

    /// Deploy to every configured target
    #[arg(long)]
    pub all: bool,

    /// Show the steps that would run without connecting
    #[arg(long)]
    pub dry_run: bool,

    /// Seconds to wait for another run's activation lock (default: reject)
    #[arg(long)]
    pub wait_secs: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutput {
    pub command: String,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<DeployPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OrchestrationResult>,
}

pub fn run(args: DeployArgs, _global: &crate::commands::GlobalArgs) -> CmdResult<DeployOutput> {
    let selector = selector_for(&args)?;
    let targets = target::select(&selector)?;
    execute(
        "deploy",
        &args.revision,
        &targets,
        "cli",
        args.dry_run,
        args.wait_secs,
    )
}

fn selector_for(args: &DeployArgs) -> rollout::Result<TargetSelector> {
    if args.all {
        return Ok(TargetSelector::All);
    }
    if let Some(branch) = &args.branch {
        return Ok(TargetSelector::Branch(branch.clone()));
    }
    if args.targets.is_empty() {
        return Err(rollout::Error::validation_missing_argument(vec![
            "--target, --branch or --all".to_string(),
        ]));
    }
    Ok(TargetSelector::Ids(args.targets.clone()))
}

/// Shared by `deploy` and `trigger`: plan or run `revision` on `targets`.
pub(crate) fn execute(
    command: &str,
    revision: &str,
    targets: &[Target],
    trigger: &str,
    dry_run: bool,
    wait_secs: Option<u64>,
) -> CmdResult<DeployOutput> {
    if targets.is_empty() {
        return Err(rollout::Error::validation_invalid_argument(
            "targets",
            "No targets matched the selection",
            None,
            None,
        ));
    }

    if dry_run {
        let plan = Orchestrator::plan(revision, targets)?;
        return Ok((
            DeployOutput {
                command: command.to_string(),
                dry_run: true,
                plan: Some(plan),
                result: None,
            },
            0,
        ));
    }

    let mut orchestrator = Orchestrator::from_config()?;
    if let Some(secs) = wait_secs {
        orchestrator = orchestrator.with_lock_wait(Duration::from_secs(secs));
    }

    cancel_on_interrupt(orchestrator.cancellation());
    let result = orchestrator.deploy(revision, targets, trigger);
    let exit_code = exit_code_for(&result);

    Ok((
        DeployOutput {
            command: command.to_string(),
            dry_run: false,
            plan: None,
            result: Some(result),
        },
        exit_code,
    ))
}

/// First Ctrl-C cancels runs that have not swapped yet; a second one
/// terminates as usual.
#[cfg(unix)]
fn cancel_on_interrupt(cancellation: Cancellation) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static INTERRUPTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_interrupt(_: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }

    std::thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            log_status!("deploy", "Interrupted; cancelling runs that have not activated");
            cancellation.cancel();
            // SAFETY: restores the default disposition.
            unsafe {
                libc::signal(libc::SIGINT, libc::SIG_DFL);
            }
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    });
}

#[cfg(not(unix))]
fn cancel_on_interrupt(_cancellation: Cancellation) {}

/// Zero when every target is active; otherwise the code of the first failure.
fn exit_code_for(result: &OrchestrationResult) -> i32 {
    if result.success {
        return 0;
    }
    result
        .runs
        .iter()
        .find_map(|run| run.error.as_ref())
        .map(|err| crate::output::exit_code_for_code_str(&err.code))
        .unwrap_or(1)
}
