//! Exit status mapping and graceful termination.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{info, warn};

/// How often a waiting loop re-checks a child that has not exited yet.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Map an exit status to an integer code.
///
/// Normal exits keep their code; signal deaths become `128 + signo`, the
/// shell convention. A status carrying neither maps to -1.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(-1)
}

/// Send SIGTERM, wait up to `grace`, then SIGKILL and reap.
pub fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let pid = child.id();
    match i32::try_from(pid) {
        Ok(raw) => {
            if let Err(errno) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                warn!(pid, error = %errno, "Failed to send SIGTERM");
            }
        }
        Err(_) => warn!(pid, "Pid out of range, skipping SIGTERM"),
    }

    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            info!(pid, ?status, "Child exited after SIGTERM");
            return Ok(status);
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }

    warn!(pid, grace_ms = grace.as_millis(), "Child ignored SIGTERM, killing");
    match child.kill() {
        Ok(()) => {}
        // Already exited between the last try_wait and kill.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    child.wait()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn(script: &str) -> Child {
        Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[test]
    fn exit_code_keeps_normal_codes() {
        let status = spawn("exit 3").wait().unwrap();
        assert_eq!(exit_code(status), 3);
    }

    #[test]
    fn exit_code_maps_signals() {
        let status = spawn("kill -9 $$").wait().unwrap();
        assert_eq!(exit_code(status), 137);
    }

    #[test]
    fn terminate_uses_sigterm_first() {
        let mut child = spawn("exec sleep 30");
        let status = terminate(&mut child, Duration::from_secs(5)).unwrap();
        assert_eq!(exit_code(status), 128 + 15);
    }

    #[test]
    fn terminate_escalates_to_sigkill() {
        let mut child = spawn("trap '' TERM; while true; do sleep 1; done");
        // Give the shell time to install the trap.
        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        let status = terminate(&mut child, Duration::from_millis(200)).unwrap();
        assert_eq!(exit_code(status), 137);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn terminate_on_exited_child_returns_its_status() {
        let mut child = spawn("exit 4");
        std::thread::sleep(Duration::from_millis(100));
        let status = terminate(&mut child, Duration::from_millis(100)).unwrap();
        assert_eq!(exit_code(status), 4);
    }
}
