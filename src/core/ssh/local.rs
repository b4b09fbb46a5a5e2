use std::path::Path;
use std::time::Duration;

use super::client::upload_command;
use super::process::{self, ProcessOutcome};
use super::{CommandOutput, Session};
use crate::error::{Error, Result, TargetDetails};

/// Executes directly on this machine. Used for localhost targets.
#[derive(Debug, Clone)]
pub struct LocalSession {
    details: TargetDetails,
}

impl LocalSession {
    pub fn new(details: TargetDetails) -> Self {
        Self { details }
    }
}

impl Session for LocalSession {
    fn target(&self) -> &TargetDetails {
        &self.details
    }

    fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        match process::run_with_timeout(process::shell_command(command), None, timeout)? {
            ProcessOutcome::Exited(out) => Ok(out),
            ProcessOutcome::TimedOut => Err(Error::remote_command_timeout(
                command,
                timeout.as_secs(),
                self.details.clone(),
            )),
        }
    }

    fn copy(&self, local_path: &Path, remote_path: &str, timeout: Duration) -> Result<()> {
        let copy_failed = |reason: &str| {
            Error::remote_copy_failed(&local_path.to_string_lossy(), remote_path, reason)
        };
        let source = std::fs::File::open(local_path).map_err(|e| copy_failed(&e.to_string()))?;

        let command = upload_command(remote_path);
        match process::run_with_timeout(process::shell_command(&command), Some(source), timeout)? {
            ProcessOutcome::Exited(out) if out.success => Ok(()),
            ProcessOutcome::Exited(out) => Err(copy_failed(out.stderr.trim())),
            ProcessOutcome::TimedOut => Err(Error::remote_command_timeout(
                &command,
                timeout.as_secs(),
                self.details.clone(),
            )),
        }
    }
}
