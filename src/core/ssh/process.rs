//! Child process execution with a hard deadline.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use super::CommandOutput;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to keep reading pipes after the child exits. A child that
/// daemonizes (an ssh control master) can leave them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub(crate) enum ProcessOutcome {
    Exited(CommandOutput),
    TimedOut,
}

/// Run `cmd` to completion, killing it once `timeout` elapses.
/// stdout/stderr are drained on helper threads so a chatty child never
/// blocks on a full pipe while we poll.
pub(crate) fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<std::fs::File>,
    timeout: Duration,
) -> Result<ProcessOutcome> {
    match stdin {
        Some(file) => cmd.stdin(file),
        None => cmd.stdin(Stdio::null()),
    };
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::internal_io(e.to_string(), Some("spawn process".to_string())))?;

    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if Instant::now() >= deadline => break None,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                kill_quietly(&mut child);
                return Err(Error::internal_io(
                    e.to_string(),
                    Some("wait for process".to_string()),
                ));
            }
        }
    };

    let Some(status) = status else {
        kill_quietly(&mut child);
        return Ok(ProcessOutcome::TimedOut);
    };

    let stdout = stdout_reader.recv_timeout(DRAIN_GRACE).unwrap_or_default();
    let stderr = stderr_reader.recv_timeout(DRAIN_GRACE).unwrap_or_default();

    Ok(ProcessOutcome::Exited(CommandOutput {
        stdout,
        stderr,
        success: status.success(),
        exit_code: status.code().unwrap_or(-1),
    }))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
    });
    rx
}

fn kill_quietly(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// `sh -c` (or `cmd /C`) for a command string.
pub(crate) fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    }

    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}
