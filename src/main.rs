use clap::{Parser, Subcommand};

use commands::GlobalArgs;

mod commands;
mod output;
mod tty;

use commands::{deploy, release, runs, target, trigger};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "rollout")]
#[command(version = VERSION)]
#[command(about = "Deploy releases to SSH targets with atomic activation and rollback")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage deployment targets
    #[command(visible_alias = "targets")]
    Target(target::TargetArgs),
    /// Deploy a revision to one or more targets
    Deploy(deploy::DeployArgs),
    /// Deploy from a push event or explicit request payload
    Trigger(trigger::TriggerArgs),
    /// Inspect, activate, roll back and prune releases
    Release(release::ReleaseArgs),
    /// Inspect recorded deployment runs
    Runs(runs::RunsArgs),
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let global = GlobalArgs {};

    let (json_result, exit_code) = commands::run_json(cli.command, &global);

    if output::print_json_result(json_result).is_err() {
        return std::process::ExitCode::from(exit_code_to_u8(1));
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
