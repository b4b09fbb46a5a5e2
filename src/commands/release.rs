use std::time::Duration;

use clap::{Args, Subcommand};
use serde::Serialize;

use rollout::orchestrator::Orchestrator;
use rollout::release::{self, Release, ReleaseManager};
use rollout::target::{self, Target};

use super::CmdResult;

#[derive(Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOutput {
    command: String,
    target_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    release: Option<Release>,
    #[serde(skip_serializing_if = "Option::is_none")]
    releases: Option<Vec<Release>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    active: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    removed: Option<Vec<String>>,
}

#[derive(Args)]
pub struct ReleaseArgs {
    #[command(subcommand)]
    command: ReleaseCommand,

    /// Seconds to wait for another run's activation lock (default: reject)
    #[arg(long, global = true)]
    wait_secs: Option<u64>,
}

#[derive(Subcommand)]
enum ReleaseCommand {
    /// List recorded releases, newest first
    List {
        /// Target ID
        target_id: String,
    },
    /// Point `current` at an already staged release
    Activate {
        /// Target ID
        target_id: String,
        /// Revision to activate
        revision: String,
    },
    /// Point `current` back at the previously active release
    Rollback {
        /// Target ID
        target_id: String,
    },
    /// Delete old inactive releases
    Prune {
        /// Target ID
        target_id: String,
        /// Releases to keep, including the active one
        #[arg(long)]
        keep: Option<usize>,
    },
}

pub fn run(args: ReleaseArgs, _global: &crate::commands::GlobalArgs) -> CmdResult<ReleaseOutput> {
    let mut orchestrator = Orchestrator::from_config()?;
    if let Some(secs) = args.wait_secs {
        orchestrator = orchestrator.with_lock_wait(Duration::from_secs(secs));
    }

    match args.command {
        ReleaseCommand::List { target_id } => list(&orchestrator, &target_id),
        ReleaseCommand::Activate {
            target_id,
            revision,
        } => activate(&orchestrator, &target_id, &revision),
        ReleaseCommand::Rollback { target_id } => rollback(&orchestrator, &target_id),
        ReleaseCommand::Prune { target_id, keep } => prune(&orchestrator, &target_id, keep),
    }
}

fn list(orchestrator: &Orchestrator, target_id: &str) -> CmdResult<ReleaseOutput> {
    let target = target::load(target_id)?;
    let ledger = orchestrator.ledgers().load(&target.id)?;
    let releases = release::list(orchestrator.ledgers(), &target.id)?;

    Ok((
        ReleaseOutput {
            command: "release.list".to_string(),
            target_id: target.id,
            releases: Some(releases),
            active: ledger.active,
            ..Default::default()
        },
        0,
    ))
}

/// Run `op` holding the target's activation lock over a fresh session.
fn with_manager<T>(
    orchestrator: &Orchestrator,
    target: &Target,
    holder: &str,
    op: impl FnOnce(&ReleaseManager, &release::TargetLock) -> rollout::Result<T>,
) -> rollout::Result<T> {
    let lock = orchestrator.locks().acquire(&target.id, holder)?;
    let session = orchestrator.connect(target)?;
    let timeout = orchestrator.defaults().transport.command_timeout();
    let manager = ReleaseManager::new(session.as_ref(), target, orchestrator.ledgers(), timeout);
    op(&manager, &lock)
}

fn activate(orchestrator: &Orchestrator, target_id: &str, revision: &str) -> CmdResult<ReleaseOutput> {
    let target = target::load(target_id)?;
    let release = with_manager(orchestrator, &target, "release.activate", |manager, lock| {
        manager.activate(lock, revision)
    })?;

    Ok((
        ReleaseOutput {
            command: "release.activate".to_string(),
            target_id: target.id,
            active: Some(release.revision.clone()),
            release: Some(release),
            ..Default::default()
        },
        0,
    ))
}

fn rollback(orchestrator: &Orchestrator, target_id: &str) -> CmdResult<ReleaseOutput> {
    let target = target::load(target_id)?;
    let release = with_manager(orchestrator, &target, "release.rollback", |manager, lock| {
        manager.rollback(lock)
    })?;

    Ok((
        ReleaseOutput {
            command: "release.rollback".to_string(),
            target_id: target.id,
            active: Some(release.revision.clone()),
            release: Some(release),
            ..Default::default()
        },
        0,
    ))
}

fn prune(orchestrator: &Orchestrator, target_id: &str, keep: Option<usize>) -> CmdResult<ReleaseOutput> {
    let target = target::load(target_id)?;
    let keep = keep
        .or(target.keep_releases)
        .unwrap_or(orchestrator.defaults().releases.keep)
        .max(1);
    let removed = with_manager(orchestrator, &target, "release.prune", |manager, lock| {
        manager.prune(lock, keep)
    })?;

    Ok((
        ReleaseOutput {
            command: "release.prune".to_string(),
            target_id: target.id,
            removed: Some(removed),
            ..Default::default()
        },
        0,
    ))
}
