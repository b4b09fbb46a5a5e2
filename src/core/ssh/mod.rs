//! Connection transport: authenticated sessions to a target.
//!
//! `Transport::connect` yields a scoped `Session`. A session is closed when it
//! is dropped, so every exit path (success, `?`, panic unwind) tears the
//! connection down and removes any materialized credential.

mod client;
mod local;
pub(crate) mod process;
mod retry;

use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::defaults::TransportDefaults;
use crate::error::{Error, RemoteCommandFailedDetails, Result, TargetDetails};
use crate::target::Target;

pub use client::{SshSession, SshTransport};
pub use local::LocalSession;
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Turn a non-zero exit into `remote.command_failed`.
    pub fn into_result(self, command: &str, target: &TargetDetails) -> Result<CommandOutput> {
        if self.success {
            return Ok(self);
        }
        Err(Error::remote_command_failed(RemoteCommandFailedDetails {
            command: command.to_string(),
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
            target: target.clone(),
        }))
    }
}

/// An open, authenticated channel to one target.
pub trait Session: Send {
    fn target(&self) -> &TargetDetails;

    /// Execute a command. A non-zero exit is `Ok` with `success == false`;
    /// `Err` means the transport failed or the deadline passed.
    fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Transfer a local file to `remote_path`, replacing it atomically.
    fn copy(&self, local_path: &Path, remote_path: &str, timeout: Duration) -> Result<()>;

    /// Run and require exit 0.
    fn run_checked(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.run(command, timeout)?.into_result(command, self.target())
    }
}

pub trait Transport: Send + Sync {
    fn connect(&self, target: &Target) -> Result<Box<dyn Session>>;
}

/// Check if a host address refers to the local machine.
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// SSH for remote hosts, direct local execution for localhost.
pub struct DefaultTransport {
    ssh: SshTransport,
}

impl DefaultTransport {
    pub fn new(defaults: TransportDefaults) -> Self {
        Self {
            ssh: SshTransport::new(defaults),
        }
    }
}

impl Transport for DefaultTransport {
    fn connect(&self, target: &Target) -> Result<Box<dyn Session>> {
        if is_local_host(&target.host) {
            log_status!(
                "ssh",
                "Target '{}' is localhost; using local execution",
                target.id
            );
            return Ok(Box::new(LocalSession::new(target.details())));
        }
        self.ssh.connect(target)
    }
}

/// Always-local transport regardless of host. Used for staging directories
/// on the machine running rollout and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn connect(&self, target: &Target) -> Result<Box<dyn Session>> {
        Ok(Box::new(LocalSession::new(target.details())))
    }
}

/// Authentication-class failures: never retried.
pub(crate) fn is_auth_failure(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    let auth_patterns = [
        "permission denied",
        "too many authentication failures",
        "no supported authentication methods",
        "host key verification failed",
        "authentication failed",
    ];
    output.exit_code == 255 && auth_patterns.iter().any(|p| stderr.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(exit_code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            success: exit_code == 0,
            exit_code,
        }
    }

    #[test]
    fn refused_connection_is_not_an_auth_failure() {
        let out = output(255, "ssh: connect to host web port 22: Connection refused");
        assert!(!is_auth_failure(&out));
    }

    #[test]
    fn classifies_publickey_denial_as_auth() {
        let out = output(255, "deploy@web: Permission denied (publickey).");
        assert!(is_auth_failure(&out));
    }

    #[test]
    fn remote_command_exit_codes_are_not_auth_failures() {
        let out = output(1, "permission denied writing /var/www");
        assert!(!is_auth_failure(&out));
    }

    #[test]
    fn local_hosts() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("::1"));
        assert!(!is_local_host("web01.example.com"));
    }

    #[test]
    fn into_result_carries_streams() {
        let err = output(2, "boom")
            .into_result("make", &TargetDetails::default())
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::RemoteCommandFailed);
        assert_eq!(err.details["exitCode"], 2);
        assert_eq!(err.details["stderr"], "boom");
    }
}
