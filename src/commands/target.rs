use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::json;

use rollout::credential::{self, CredentialRef};
use rollout::log_status;
use rollout::orchestrator::Orchestrator;
use rollout::release::LedgerStore;
use rollout::target::{self, Reachability, Target};

use super::{CmdResult, DynamicSetArgs};

#[derive(Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutput {
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<Target>,
    #[serde(skip_serializing_if = "Option::is_none")]
    targets: Option<Vec<Target>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deleted: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reachability: Option<Reachability>,
}

#[derive(Args)]
pub struct TargetArgs {
    #[command(subcommand)]
    command: TargetCommand,
}

#[derive(Subcommand)]
enum TargetCommand {
    /// Register a deployment target
    Create {
        /// JSON input spec (inline, @file, or - for stdin)
        #[arg(long)]
        json: Option<String>,

        /// Target ID (derived from host when omitted)
        id: Option<String>,
        /// SSH host
        #[arg(long)]
        host: Option<String>,
        /// SSH username
        #[arg(long)]
        user: Option<String>,
        /// SSH port (default: 22)
        #[arg(long)]
        port: Option<u16>,
        /// Remote directory holding releases/, shared/ and current
        #[arg(long)]
        deploy_path: Option<String>,
        /// Branch whose pushes deploy to this target
        #[arg(long)]
        branch: Option<String>,
        /// Repository fetched into each release
        #[arg(long)]
        repository: Option<String>,
    },
    /// Display target configuration
    Show {
        /// Target ID or host
        target_id: String,
    },
    /// Modify target settings
    #[command(visible_aliases = ["edit", "merge"])]
    Set {
        #[command(flatten)]
        args: DynamicSetArgs,
    },
    /// Remove a target configuration
    Delete {
        /// Target ID
        target_id: String,
    },
    /// List all configured targets
    List,
    /// Set how rollout authenticates to the target
    Credential {
        /// Target ID
        target_id: String,
        /// Private key file on this machine
        #[arg(long, conflicts_with_all = ["agent", "keychain", "clear"])]
        identity_file: Option<String>,
        /// Use keys from the running ssh-agent
        #[arg(long, conflicts_with_all = ["keychain", "clear"])]
        agent: bool,
        /// Keychain entry holding the private key
        #[arg(long, conflicts_with = "clear")]
        keychain: Option<String>,
        /// Private key file to store under the keychain entry
        #[arg(long, requires = "keychain")]
        import: Option<String>,
        /// Fall back to the default ssh identity resolution
        #[arg(long)]
        clear: bool,
    },
    /// Open a session and run a no-op command to verify access
    Check {
        /// Target ID
        target_id: String,
    },
}

pub fn run(args: TargetArgs, _global: &crate::commands::GlobalArgs) -> CmdResult<TargetOutput> {
    match args.command {
        TargetCommand::Create {
            json,
            id,
            host,
            user,
            port,
            deploy_path,
            branch,
            repository,
        } => {
            let json_spec = match json {
                Some(spec) => spec,
                None => cli_spec(id, host, user, port, deploy_path, branch, repository)?,
            };
            create(&json_spec)
        }
        TargetCommand::Show { target_id } => show(&target_id),
        TargetCommand::Set { args } => set(args),
        TargetCommand::Delete { target_id } => delete(&target_id),
        TargetCommand::List => list(),
        TargetCommand::Credential {
            target_id,
            identity_file,
            agent,
            keychain,
            import,
            clear,
        } => set_credential(&target_id, identity_file, agent, keychain, import, clear),
        TargetCommand::Check { target_id } => check(&target_id),
    }
}

fn required(value: Option<String>, field: &str) -> rollout::Result<String> {
    value.ok_or_else(|| {
        rollout::Error::validation_invalid_argument(
            field,
            format!("Missing required argument: --{}", field),
            None,
            None,
        )
    })
}

fn cli_spec(
    id: Option<String>,
    host: Option<String>,
    user: Option<String>,
    port: Option<u16>,
    deploy_path: Option<String>,
    branch: Option<String>,
    repository: Option<String>,
) -> rollout::Result<String> {
    let host = required(host, "host")?;
    let user = required(user, "user")?;
    let deploy_path = required(deploy_path, "deploy-path")?;
    let id = match id {
        Some(id) => id,
        None => Target::generate_id(&host)?,
    };

    let mut spec = json!({
        "id": id,
        "host": host,
        "user": user,
        "port": port.unwrap_or(22),
        "deployPath": deploy_path,
    });
    if let Some(branch) = branch {
        spec["branch"] = json!(branch);
    }
    if let Some(repository) = repository {
        spec["repository"] = json!(repository);
    }
    Ok(spec.to_string())
}

fn create(json_spec: &str) -> CmdResult<TargetOutput> {
    let target = target::create(json_spec)?;
    Ok((
        TargetOutput {
            command: "target.create".to_string(),
            target_id: Some(target.id.clone()),
            target: Some(target),
            updated: Some(vec!["created".to_string()]),
            ..Default::default()
        },
        0,
    ))
}

fn show(target_id: &str) -> CmdResult<TargetOutput> {
    let target = target::load(target_id)
        .or_else(|original_error| target::find_by_host(target_id).ok_or(original_error))?;

    Ok((
        TargetOutput {
            command: "target.show".to_string(),
            target_id: Some(target.id.clone()),
            target: Some(target),
            ..Default::default()
        },
        0,
    ))
}

fn set(args: DynamicSetArgs) -> CmdResult<TargetOutput> {
    let merged = super::merge_json_sources(args.json_spec(), &args.extra)?;
    if merged.as_object().map_or(true, |obj| obj.is_empty()) {
        return Err(rollout::Error::validation_missing_argument(vec![
            "json or --key value flags".to_string(),
        ]));
    }

    let result = target::merge(args.id.as_deref(), &merged.to_string())?;
    let target = target::load(&result.id)?;

    Ok((
        TargetOutput {
            command: "target.set".to_string(),
            target_id: Some(result.id),
            target: Some(target),
            updated: Some(result.updated_fields),
            ..Default::default()
        },
        0,
    ))
}

fn delete(target_id: &str) -> CmdResult<TargetOutput> {
    let removed = target::delete(target_id, &LedgerStore::open_default()?)?;
    log_status!("target", "Removed '{}' and its release history", removed.id);

    Ok((
        TargetOutput {
            command: "target.delete".to_string(),
            target_id: Some(removed.id.clone()),
            deleted: Some(vec![removed.id]),
            ..Default::default()
        },
        0,
    ))
}

fn list() -> CmdResult<TargetOutput> {
    let targets = target::list()?;

    Ok((
        TargetOutput {
            command: "target.list".to_string(),
            targets: Some(targets),
            ..Default::default()
        },
        0,
    ))
}

fn set_credential(
    target_id: &str,
    identity_file: Option<String>,
    agent: bool,
    keychain: Option<String>,
    import: Option<String>,
    clear: bool,
) -> CmdResult<TargetOutput> {
    let credential = if clear {
        None
    } else if let Some(path) = identity_file {
        Some(CredentialRef::IdentityFile { path })
    } else if agent {
        Some(CredentialRef::Agent)
    } else if let Some(entry) = keychain {
        if let Some(key_path) = import {
            import_key(&entry, &key_path)?;
        }
        Some(CredentialRef::Keychain { entry })
    } else {
        return Err(rollout::Error::validation_missing_argument(vec![
            "--identity-file, --agent, --keychain or --clear".to_string(),
        ]));
    };

    let target = target::set_credential(target_id, credential.clone())?;
    log_status!(
        "target",
        "Credential for '{}' set to {}",
        target.id,
        credential
            .as_ref()
            .map(|c| c.describe())
            .unwrap_or_else(|| "default".to_string())
    );

    Ok((
        TargetOutput {
            command: "target.credential".to_string(),
            target_id: Some(target.id.clone()),
            credential: Some(
                credential
                    .map(|c| c.describe())
                    .unwrap_or_else(|| "default".to_string()),
            ),
            target: Some(target),
            ..Default::default()
        },
        0,
    ))
}

fn import_key(entry: &str, key_path: &str) -> rollout::Result<()> {
    let expanded = shellexpand::tilde(key_path).to_string();
    let material = std::fs::read_to_string(&expanded)
        .map_err(|e| rollout::Error::internal_io(e.to_string(), Some(expanded.clone())))?;
    if !credential::looks_like_private_key(&material) {
        return Err(rollout::Error::validation_invalid_argument(
            "import",
            "File does not contain a private key",
            Some(key_path.to_string()),
            None,
        ));
    }
    credential::store(entry, &material)
}

fn check(target_id: &str) -> CmdResult<TargetOutput> {
    let target = target::load(target_id)?;
    let orchestrator = Orchestrator::from_config()?;
    let timeout = orchestrator.defaults().transport.command_timeout();

    let outcome = orchestrator
        .connect(&target)
        .and_then(|session| session.run_checked("true", timeout).map(|_| ()));
    let target = target::record_reachability(&target.id, &outcome)?;
    outcome?;

    Ok((
        TargetOutput {
            command: "target.check".to_string(),
            target_id: Some(target.id.clone()),
            reachability: Some(target.reachability.clone()),
            target: Some(target),
            ..Default::default()
        },
        0,
    ))
}
