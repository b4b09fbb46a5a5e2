use clap::Args;

use rollout::log_status;
use rollout::target;
use rollout::trigger;

use super::deploy::{self, DeployOutput};
use super::CmdResult;

#[derive(Args)]
pub struct TriggerArgs {
    /// Event payload: inline JSON, @file, or - for stdin
    #[arg(long, default_value = "-")]
    pub event: String,

    /// Show the steps that would run without connecting
    #[arg(long)]
    pub dry_run: bool,

    /// Seconds to wait for another run's activation lock (default: reject)
    #[arg(long)]
    pub wait_secs: Option<u64>,
}

pub fn run(args: TriggerArgs, _global: &crate::commands::GlobalArgs) -> CmdResult<DeployOutput> {
    let request = trigger::from_spec(&args.event)?;
    let targets = target::select(&request.selector)?;
    if targets.is_empty() {
        log_status!("trigger", "No targets track {}; nothing to do", request.source);
        return Ok((
            DeployOutput {
                command: "trigger".to_string(),
                dry_run: args.dry_run,
                plan: None,
                result: None,
            },
            0,
        ));
    }
    log_status!(
        "trigger",
        "{} -> {} target(s) from {}",
        request.revision,
        targets.len(),
        request.source
    );

    deploy::execute(
        "trigger",
        &request.revision,
        &targets,
        &request.source,
        args.dry_run,
        args.wait_secs,
    )
}
