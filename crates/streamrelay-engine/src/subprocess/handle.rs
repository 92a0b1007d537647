//! Handle over a spawned child and its three pipe endpoints.
//!
//! Each endpoint can be closed independently; closing drops the parent's end
//! of the pipe, which is how the child observes EOF on stdin.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tracing::{debug, info};

use super::signal;
use crate::relay::RelayError;

/// One of the child's standard streams, as seen from the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// The child's stdin; the parent writes to it.
    Input,
    /// The child's stdout; the parent reads from it.
    Output,
    /// The child's stderr; the parent reads from it.
    Error,
}

impl Endpoint {
    pub const ALL: [Self; 3] = [Self::Input, Self::Output, Self::Error];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Input => "stdin",
            Self::Output => "stdout",
            Self::Error => "stderr",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A spawned child with piped stdin, stdout and stderr.
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit_code: Option<i32>,
}

impl ChildHandle {
    /// Spawn `cmd` with all three standard streams piped.
    pub fn spawn(cmd: &mut Command) -> Result<Self, RelayError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|e| RelayError::Spawn {
            reason: e.to_string(),
        })?;
        info!(pid = child.id(), program = ?cmd.get_program(), "Spawned child");
        Self::new(child)
    }

    /// Wrap an already spawned child. All three streams must be piped.
    pub fn new(mut child: Child) -> Result<Self, RelayError> {
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let missing = if stdin.is_none() {
            Some(Endpoint::Input)
        } else if stdout.is_none() {
            Some(Endpoint::Output)
        } else if stderr.is_none() {
            Some(Endpoint::Error)
        } else {
            None
        };
        if let Some(endpoint) = missing {
            return Err(RelayError::MissingPipe { endpoint });
        }

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr,
            exit_code: None,
        })
    }

    /// OS process id of the child.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Whether the parent still holds `endpoint` open.
    pub const fn is_open(&self, endpoint: Endpoint) -> bool {
        match endpoint {
            Endpoint::Input => self.stdin.is_some(),
            Endpoint::Output => self.stdout.is_some(),
            Endpoint::Error => self.stderr.is_some(),
        }
    }

    /// Number of endpoints still open.
    pub fn open_count(&self) -> usize {
        Endpoint::ALL.iter().filter(|e| self.is_open(**e)).count()
    }

    /// Exit code, once the child has been reaped.
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Borrow the descriptor behind `endpoint`, if it is still open.
    pub fn fd(&self, endpoint: Endpoint) -> Option<BorrowedFd<'_>> {
        match endpoint {
            Endpoint::Input => self.stdin.as_ref().map(AsFd::as_fd),
            Endpoint::Output => self.stdout.as_ref().map(AsFd::as_fd),
            Endpoint::Error => self.stderr.as_ref().map(AsFd::as_fd),
        }
    }

    /// Switch every open endpoint to non-blocking mode.
    pub fn set_nonblocking(&self) -> Result<(), RelayError> {
        for endpoint in Endpoint::ALL {
            if let Some(fd) = self.fd(endpoint) {
                set_nonblocking(fd).map_err(|source| RelayError::Io { endpoint, source })?;
            }
        }
        Ok(())
    }

    /// Write to stdin. Fails with `NotConnected` once input is closed.
    pub fn write_input(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Read from stdout or stderr. Fails with `NotConnected` once closed.
    pub fn read_endpoint(&mut self, endpoint: Endpoint, buf: &mut [u8]) -> io::Result<usize> {
        match endpoint {
            Endpoint::Output => match self.stdout.as_mut() {
                Some(stdout) => stdout.read(buf),
                None => Err(io::ErrorKind::NotConnected.into()),
            },
            Endpoint::Error => match self.stderr.as_mut() {
                Some(stderr) => stderr.read(buf),
                None => Err(io::ErrorKind::NotConnected.into()),
            },
            Endpoint::Input => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "stdin is not readable",
            )),
        }
    }

    /// Close the parent's end of `endpoint`. Returns whether it was open.
    pub fn close(&mut self, endpoint: Endpoint) -> bool {
        let was_open = match endpoint {
            Endpoint::Input => self.stdin.take().is_some(),
            Endpoint::Output => self.stdout.take().is_some(),
            Endpoint::Error => self.stderr.take().is_some(),
        };
        if was_open {
            debug!(pid = self.child.id(), %endpoint, "Closed endpoint");
        }
        was_open
    }

    /// Close every endpoint still open.
    pub fn close_all(&mut self) {
        for endpoint in Endpoint::ALL {
            self.close(endpoint);
        }
    }

    /// Block until the child exits and return its exit code.
    pub fn wait(&mut self) -> io::Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self.child.wait()?;
        Ok(self.record(status))
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> io::Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        Ok(self.child.try_wait()?.map(|status| self.record(status)))
    }

    /// Wait for exit until `deadline`, giving up early when `stop` says so.
    ///
    /// Returns `Ok(None)` if the child is still running when the wait ends.
    pub fn wait_until<F>(&mut self, deadline: Option<Instant>, stop: F) -> io::Result<Option<i32>>
    where
        F: Fn() -> bool,
    {
        loop {
            if let Some(code) = self.try_wait()? {
                return Ok(Some(code));
            }
            if stop() || deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
            std::thread::sleep(signal::EXIT_POLL_INTERVAL);
        }
    }

    /// Ask the child to stop: SIGTERM, then SIGKILL after `grace`.
    pub fn terminate(&mut self, grace: Duration) -> io::Result<i32> {
        if let Some(code) = self.try_wait()? {
            return Ok(code);
        }
        let status = signal::terminate(&mut self.child, grace)?;
        Ok(self.record(status))
    }

    fn record(&mut self, status: std::process::ExitStatus) -> i32 {
        let code = signal::exit_code(status);
        debug!(pid = self.child.id(), code, "Child exited");
        self.exit_code = Some(code);
        code
    }
}

fn set_nonblocking<Fd: AsFd>(fd: Fd) -> io::Result<()> {
    let flags = fcntl(&fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(&fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ChildHandle {
        ChildHandle::spawn(Command::new("/bin/sh").arg("-c").arg(script)).unwrap()
    }

    #[test]
    fn spawn_pipes_all_three_streams() {
        let mut handle = sh("cat");
        assert_eq!(handle.open_count(), 3);
        for endpoint in Endpoint::ALL {
            assert!(handle.fd(endpoint).is_some());
        }
        handle.close_all();
        assert_eq!(handle.wait().unwrap(), 0);
    }

    #[test]
    fn new_rejects_child_without_pipes() {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let err = ChildHandle::new(child).unwrap_err();
        assert!(matches!(
            err,
            RelayError::MissingPipe {
                endpoint: Endpoint::Input
            }
        ));
    }

    #[test]
    fn spawn_failure_is_reported() {
        let err = ChildHandle::spawn(&mut Command::new("/nonexistent/streamrelay-test")).unwrap_err();
        assert!(matches!(err, RelayError::Spawn { .. }));
    }

    #[test]
    fn close_is_idempotent() {
        let mut handle = sh("cat");
        assert!(handle.close(Endpoint::Input));
        assert!(!handle.close(Endpoint::Input));
        assert!(!handle.is_open(Endpoint::Input));
        assert!(matches!(
            handle.write_input(b"x").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        ));
        handle.close_all();
        handle.wait().unwrap();
    }

    #[test]
    fn exit_code_is_cached_after_wait() {
        let mut handle = sh("exit 7");
        handle.close_all();
        assert_eq!(handle.wait().unwrap(), 7);
        assert_eq!(handle.exit_code(), Some(7));
        assert_eq!(handle.try_wait().unwrap(), Some(7));
    }

    #[test]
    fn stdin_is_not_readable() {
        let mut handle = sh("cat");
        let mut buf = [0u8; 4];
        let err = handle.read_endpoint(Endpoint::Input, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        handle.close_all();
        handle.wait().unwrap();
    }

    #[test]
    fn nonblocking_read_reports_would_block() {
        let mut handle = sh("sleep 5");
        handle.set_nonblocking().unwrap();
        let mut buf = [0u8; 16];
        let err = handle.read_endpoint(Endpoint::Output, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        handle.close_all();
        handle.terminate(Duration::from_millis(500)).unwrap();
    }

    #[test]
    fn wait_until_gives_up_at_deadline() {
        let mut handle = sh("sleep 5");
        handle.close_all();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(handle.wait_until(Some(deadline), || false).unwrap(), None);
        let code = handle.terminate(Duration::from_millis(500)).unwrap();
        assert_eq!(code, 128 + 15);
    }
}
