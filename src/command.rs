//! External command execution with a hard timeout
//!
//! The only place the crate spawns processes. Output is drained on helper
//! threads so a chatty child can never block on a full pipe while the parent
//! polls for exit.

use crate::error::{IdResetError, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// None if terminated by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Turn a non-zero exit into an error
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(IdResetError::CommandFailed {
                command: context.to_string(),
                code: self.exit_code.unwrap_or(-1),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run `program args...`, killing it if it outlives `timeout`
pub fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    debug!("run_with_timeout: {} {:?} (timeout {:?})", program, args, timeout);

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match wait_deadline(&mut child, timeout)? {
        Some(status) => status,
        None => {
            warn!("{} exceeded {:?}, killing pid {}", program, timeout, child.id());
            let _ = child.kill();
            let _ = child.wait();
            return Err(IdResetError::Timeout {
                what: program.to_string(),
                secs: timeout.as_secs(),
            });
        }
    };

    Ok(CommandOutput {
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
        exit_code: status.code(),
        success: status.success(),
    })
}

fn wait_deadline(child: &mut Child, timeout: Duration) -> Result<Option<std::process::ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_captures_output_and_exit_code() {
        let out = run_with_timeout("sh", &["-c", "echo hi; echo err >&2; exit 3"], Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.stdout.trim(), "hi");
        assert_eq!(out.stderr.trim(), "err");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success);
        assert!(matches!(
            out.ensure_success("sh"),
            Err(IdResetError::CommandFailed { code: 3, .. })
        ));
    }

    #[test]
    fn test_slow_command_times_out() {
        let start = Instant::now();
        let err = run_with_timeout("sleep", &["5"], Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, IdResetError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
