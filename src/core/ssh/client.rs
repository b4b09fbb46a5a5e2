use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;

use super::process::{self, ProcessOutcome};
use super::retry::RetryPolicy;
use super::{is_auth_failure, CommandOutput, Session, Transport};
use crate::credential::{self, ResolvedCredential};
use crate::defaults::TransportDefaults;
use crate::error::{Error, Result, TargetDetails};
use crate::target::Target;
use crate::utils::shell;

const CONTROL_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens multiplexed ssh sessions using the system `ssh` binary.
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    defaults: TransportDefaults,
}

impl SshTransport {
    pub fn new(defaults: TransportDefaults) -> Self {
        Self { defaults }
    }
}

impl Transport for SshTransport {
    fn connect(&self, target: &Target) -> Result<Box<dyn Session>> {
        Ok(Box::new(SshSession::connect(target, &self.defaults)?))
    }
}

/// One authenticated connection (an ssh ControlMaster). Every `run` and
/// `copy` reuses it; dropping the session closes the master and removes
/// the control socket and any materialized key.
///
/// Retries happen only while the master is being established. A command
/// sent over an established master runs exactly once: whatever it exits
/// with, 255 included, is reported as the command's result.
pub struct SshSession {
    details: TargetDetails,
    destination: String,
    port: u16,
    credential: ResolvedCredential,
    control_dir: TempDir,
    defaults: TransportDefaults,
    policy: RetryPolicy,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("destination", &self.destination)
            .field("port", &self.port)
            .field("credential", &self.credential)
            .finish()
    }
}

impl SshSession {
    pub fn connect(target: &Target, defaults: &TransportDefaults) -> Result<Self> {
        let credential = credential::resolve(&target.id, target.credential.as_ref())?;
        let control_dir = tempfile::Builder::new()
            .prefix("rollout-ssh-")
            .tempdir()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create control dir".to_string())))?;

        let session = Self {
            details: target.details(),
            destination: format!("{}@{}", target.user, target.host),
            port: target.port,
            credential,
            control_dir,
            defaults: defaults.clone(),
            policy: RetryPolicy::from_defaults(defaults),
        };

        log_status!(
            "ssh",
            "Connecting to {} ({})",
            session.destination,
            target
                .credential
                .as_ref()
                .map(|c| c.describe())
                .unwrap_or_else(|| "ssh defaults".to_string())
        );

        session.establish()?;

        log_status!("ssh", "Connected to {}", session.destination);
        Ok(session)
    }

    fn ssh(&self) -> Command {
        Command::new(&self.defaults.ssh_program)
    }

    fn control_path(&self) -> PathBuf {
        self.control_dir.path().join("master.sock")
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = self.credential.identity_file() {
            args.push("-i".to_string());
            args.push(identity_file.to_string_lossy().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Key-based only: BatchMode makes any password or passphrase prompt
        // an immediate authentication failure.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "PasswordAuthentication=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.defaults.connect_timeout_secs),
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.defaults.server_alive_interval_secs),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "-S".to_string(),
            self.control_path().to_string_lossy().to_string(),
        ]);

        args
    }

    fn establish(&self) -> Result<()> {
        self.policy
            .run(&format!("connect {}", self.destination), |attempt| {
                self.open_master(attempt)
            })
    }

    fn open_master(&self, attempt: u32) -> Result<()> {
        let mut cmd = self.ssh();
        cmd.args(self.base_args());
        cmd.args(["-M", "-o", "ControlPersist=yes", "-f", "-N"]);
        cmd.arg(&self.destination);

        // ConnectTimeout covers the TCP handshake only; allow slack for auth.
        let deadline = self.defaults.connect_timeout() + Duration::from_secs(5);
        match process::run_with_timeout(cmd, None, deadline)? {
            ProcessOutcome::TimedOut => Err(Error::ssh_timeout(self.details.clone(), attempt)),
            ProcessOutcome::Exited(out) if out.success => Ok(()),
            ProcessOutcome::Exited(out) => Err(self.classify(&out, attempt)),
        }
    }

    fn classify(&self, out: &CommandOutput, attempt: u32) -> Error {
        if is_auth_failure(out) {
            return Error::ssh_auth_failed(self.details.clone(), out.stderr.trim());
        }
        Error::ssh_unreachable(self.details.clone(), attempt, out.stderr.trim())
    }

    fn control(&self, operation: &str) -> bool {
        let control = self.control_path().to_string_lossy().to_string();
        let mut cmd = self.ssh();
        cmd.args(["-S", control.as_str(), "-O", operation]);
        cmd.arg(&self.destination);
        matches!(
            process::run_with_timeout(cmd, None, CONTROL_CHECK_TIMEOUT),
            Ok(ProcessOutcome::Exited(out)) if out.success
        )
    }

    /// Reopen the master if it died since the last command. This is the
    /// only point where a command path may retry.
    fn ensure_master(&self) -> Result<()> {
        if self.control("check") {
            return Ok(());
        }
        log_status!("ssh", "Connection to {} was lost; reconnecting", self.destination);
        self.establish()
    }

    fn exec(&self, command: &str, stdin: Option<&Path>, timeout: Duration) -> Result<CommandOutput> {
        self.ensure_master()?;

        let stdin_file = match stdin {
            Some(path) => Some(std::fs::File::open(path).map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("open {}", path.display())))
            })?),
            None => None,
        };

        let mut cmd = self.ssh();
        cmd.args(self.base_args());
        cmd.args(["-o", "ControlMaster=no"]);
        cmd.arg(&self.destination);
        cmd.arg(command);

        match process::run_with_timeout(cmd, stdin_file, timeout)? {
            ProcessOutcome::Exited(out) => Ok(out),
            ProcessOutcome::TimedOut => Err(Error::remote_command_timeout(
                command,
                timeout.as_secs(),
                self.details.clone(),
            )),
        }
    }
}

impl Session for SshSession {
    fn target(&self) -> &TargetDetails {
        &self.details
    }

    fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        self.exec(command, None, timeout)
    }

    fn copy(&self, local_path: &Path, remote_path: &str, timeout: Duration) -> Result<()> {
        if !local_path.is_file() {
            return Err(Error::remote_copy_failed(
                &local_path.to_string_lossy(),
                remote_path,
                "local file does not exist",
            ));
        }

        log_status!("ssh", "Uploading {} -> {}", local_path.display(), remote_path);
        let out = self.exec(&upload_command(remote_path), Some(local_path), timeout)?;
        if !out.success {
            return Err(Error::remote_copy_failed(
                &local_path.to_string_lossy(),
                remote_path,
                out.stderr.trim(),
            ));
        }
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.control("exit");
        log_status!("ssh", "Closed session to {}", self.destination);
    }
}

/// Remote side of an upload: stdin lands in a sibling temp file that is then
/// renamed over the destination.
pub(crate) fn upload_command(remote_path: &str) -> String {
    let tmp = format!("{}.rollout-tmp", remote_path);
    format!(
        "mkdir -p \"$(dirname {dest})\" && cat > {tmp} && mv -f {tmp} {dest}",
        tmp = shell::quote_path(&tmp),
        dest = shell::quote_path(remote_path),
    )
}
