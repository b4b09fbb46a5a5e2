use clap::{Args, Subcommand};
use serde::Serialize;

use rollout::run::{DeploymentRun, RunStore};

use super::CmdResult;

#[derive(Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunsOutput {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<DeploymentRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    runs: Option<Vec<DeploymentRun>>,
}

#[derive(Args)]
pub struct RunsArgs {
    #[command(subcommand)]
    command: RunsCommand,
}

#[derive(Subcommand)]
enum RunsCommand {
    /// List finished deployment runs, newest first
    List {
        /// Only runs against this target
        #[arg(long)]
        target: Option<String>,
        /// Maximum number of runs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one run with its step results
    Show {
        /// Run ID
        run_id: String,
    },
}

pub fn run(args: RunsArgs, _global: &crate::commands::GlobalArgs) -> CmdResult<RunsOutput> {
    let store = RunStore::open_default()?;

    match args.command {
        RunsCommand::List { target, limit } => {
            let mut runs = store.list(target.as_deref())?;
            runs.truncate(limit);
            Ok((
                RunsOutput {
                    command: "runs.list".to_string(),
                    runs: Some(runs),
                    ..Default::default()
                },
                0,
            ))
        }
        RunsCommand::Show { run_id } => {
            let run = store.load(&run_id)?;
            Ok((
                RunsOutput {
                    command: "runs.show".to_string(),
                    run: Some(run),
                    ..Default::default()
                },
                0,
            ))
        }
    }
}
