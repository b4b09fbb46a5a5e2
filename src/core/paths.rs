use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Environment override for the config root, used by CI runners and tests.
pub const HOME_ENV: &str = "ROLLOUT_HOME";

/// Base rollout config directory (~/.config/rollout/ on unix, %APPDATA%\rollout on Windows)
pub fn rollout() -> Result<PathBuf> {
    if let Ok(custom) = env::var(HOME_ENV) {
        if !custom.trim().is_empty() {
            return Ok(PathBuf::from(shellexpand::tilde(&custom).to_string()));
        }
    }

    #[cfg(windows)]
    {
        let appdata = env::var("APPDATA").map_err(|_| {
            Error::internal_unexpected(
                "APPDATA environment variable not set on Windows".to_string(),
            )
        })?;
        Ok(PathBuf::from(appdata).join("rollout"))
    }

    #[cfg(not(windows))]
    {
        let home = env::var("HOME").map_err(|_| {
            Error::internal_unexpected(
                "HOME environment variable not set on Unix-like system".to_string(),
            )
        })?;
        Ok(PathBuf::from(home).join(".config").join("rollout"))
    }
}

/// Global rollout.json config file path
pub fn rollout_json() -> Result<PathBuf> {
    Ok(rollout()?.join("rollout.json"))
}

/// Targets directory
pub fn targets() -> Result<PathBuf> {
    Ok(rollout()?.join("targets"))
}

/// Target config file path
pub fn target(id: &str) -> Result<PathBuf> {
    Ok(targets()?.join(format!("{}.json", id)))
}

/// Local state root: release ledgers, locks, run records
pub fn state() -> Result<PathBuf> {
    Ok(rollout()?.join("state"))
}

/// Per-target release ledgers
pub fn ledgers() -> Result<PathBuf> {
    Ok(state()?.join("releases"))
}

/// Per-target activation lock files
pub fn locks() -> Result<PathBuf> {
    Ok(state()?.join("locks"))
}

/// Finalized deployment run records
pub fn runs() -> Result<PathBuf> {
    Ok(state()?.join("runs"))
}
