//! Credential references and their resolution at connect time.
//!
//! Targets never carry secret material. They carry a reference: an identity
//! file path, the running ssh-agent, or an entry in the system keychain
//! (macOS Keychain, Linux Secret Service, Windows Credential Manager). The
//! reference is resolved only when a session is opened, and anything
//! materialized on disk lives exactly as long as the session.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use keyring::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::{Error, ErrorCode, Result};

const SERVICE_NAME: &str = "rollout";

pub const AGENT_SOCK_ENV: &str = "SSH_AUTH_SOCK";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CredentialRef {
    /// Private key file on the machine running rollout.
    #[serde(rename_all = "camelCase")]
    IdentityFile { path: String },
    /// Keys held by the ssh-agent behind `SSH_AUTH_SOCK`.
    Agent,
    /// Private key stored in the system keychain under this entry name.
    #[serde(rename_all = "camelCase")]
    Keychain { entry: String },
}

impl fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl CredentialRef {
    /// Loggable description. Never includes key material.
    pub fn describe(&self) -> String {
        match self {
            CredentialRef::IdentityFile { path } => format!("identity-file:{}", path),
            CredentialRef::Agent => "agent".to_string(),
            CredentialRef::Keychain { entry } => format!("keychain:{}", entry),
        }
    }
}

/// A credential ready to hand to ssh. Dropping it removes any key file
/// that was materialized from the keychain.
pub struct ResolvedCredential {
    identity_file: Option<PathBuf>,
    materialized: Option<NamedTempFile>,
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("identity_file", &self.identity_file)
            .field("materialized", &self.materialized.is_some())
            .finish()
    }
}

impl ResolvedCredential {
    /// Fall back to ssh's own resolution (agent, ~/.ssh/id_*). Still key based:
    /// sessions run with BatchMode so password prompts are impossible.
    pub fn ssh_defaults() -> Self {
        Self {
            identity_file: None,
            materialized: None,
        }
    }

    pub fn identity_file(&self) -> Option<&Path> {
        self.identity_file.as_deref()
    }
}

/// Resolve a target's credential reference. `None` means ssh defaults.
pub fn resolve(target_id: &str, credential: Option<&CredentialRef>) -> Result<ResolvedCredential> {
    match credential {
        None => Ok(ResolvedCredential::ssh_defaults()),
        Some(CredentialRef::IdentityFile { path }) => {
            let expanded = shellexpand::tilde(path).to_string();
            if !Path::new(&expanded).exists() {
                return Err(Error::credential_unavailable(
                    target_id,
                    format!("identity file not found: {}", expanded),
                ));
            }
            Ok(ResolvedCredential {
                identity_file: Some(PathBuf::from(expanded)),
                materialized: None,
            })
        }
        Some(CredentialRef::Agent) => {
            let sock = std::env::var(AGENT_SOCK_ENV).unwrap_or_default();
            if sock.trim().is_empty() {
                return Err(Error::credential_unavailable(
                    target_id,
                    format!("{} is not set; start ssh-agent and add a key", AGENT_SOCK_ENV),
                ));
            }
            Ok(ResolvedCredential::ssh_defaults())
        }
        Some(CredentialRef::Keychain { entry }) => {
            let key = get(entry)?.ok_or_else(|| {
                Error::credential_unavailable(
                    target_id,
                    format!("no keychain entry named '{}'", entry),
                )
                .with_hint(format!(
                    "Run 'rollout target credential {} --keychain {} --import <key-file>'",
                    target_id, entry
                ))
            })?;
            materialize(target_id, &key)
        }
    }
}

/// Write key material to a private temp file (0600 on unix).
fn materialize(target_id: &str, key: &str) -> Result<ResolvedCredential> {
    let mut file = tempfile::Builder::new()
        .prefix(".rollout-key-")
        .tempfile()
        .map_err(|e| Error::internal_io(e.to_string(), Some("create key file".to_string())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).map_err(
            |e| Error::internal_io(e.to_string(), Some("set key file permissions".to_string())),
        )?;
    }

    let mut material = key.trim_end().to_string();
    material.push('\n');
    file.write_all(material.as_bytes()).map_err(|_| {
        Error::credential_unavailable(target_id, "failed to write keychain key to disk")
    })?;

    Ok(ResolvedCredential {
        identity_file: Some(file.path().to_path_buf()),
        materialized: Some(file),
    })
}

/// Sanity check before a private key is accepted for storage.
pub fn looks_like_private_key(content: &str) -> bool {
    content.contains("-----BEGIN") && content.contains("PRIVATE KEY-----")
}

// ============================================================================
// Keychain storage
// ============================================================================

fn keyring_error(e: keyring::Error) -> Error {
    Error::new(
        ErrorCode::CredentialUnavailable,
        format!("Keychain error: {}", e),
        Value::Null,
    )
}

/// Stores a private key in the keychain under `entry`.
pub fn store(entry: &str, key_material: &str) -> Result<()> {
    let item = Entry::new(SERVICE_NAME, entry).map_err(keyring_error)?;
    item.set_password(key_material).map_err(keyring_error)?;
    Ok(())
}

/// Returns `None` if the entry doesn't exist.
pub fn get(entry: &str) -> Result<Option<String>> {
    let item = Entry::new(SERVICE_NAME, entry).map_err(keyring_error)?;

    match item.get_password() {
        Ok(value) => Ok(Some(value)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(keyring_error(e)),
    }
}

pub fn delete(entry: &str) -> Result<()> {
    let item = Entry::new(SERVICE_NAME, entry).map_err(keyring_error)?;

    match item.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(keyring_error(e)),
    }
}
