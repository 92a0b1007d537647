//! Readiness multiplexing over raw descriptors.
//!
//! The relay describes what it is waiting for as a slice of
//! [`Registration`]s on every call; the multiplexer keeps no registrations of
//! its own. [`PollMultiplexer`] backs this with poll(2).

use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::subprocess::Endpoint;

/// Readiness condition of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Identifies what a registration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// One of the child's pipes.
    Endpoint(Endpoint),
    /// The cancellation wake socket.
    Wake,
}

/// A descriptor to watch for one wait call.
#[derive(Debug, Clone, Copy)]
pub struct Registration<'fd> {
    pub token: Token,
    pub fd: BorrowedFd<'fd>,
    pub interest: Interest,
}

/// What the OS reported for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    /// Whether touching the descriptor for `interest` will make progress.
    ///
    /// Hang-up and error conditions count for both directions: a read then
    /// sees EOF and a write sees the failure.
    pub const fn satisfies(self, interest: Interest) -> bool {
        let ready = match interest {
            Interest::Readable => self.readable,
            Interest::Writable => self.writable,
        };
        ready || self.hangup || self.error
    }
}

impl From<PollFlags> for Readiness {
    fn from(flags: PollFlags) -> Self {
        Self {
            readable: flags.intersects(PollFlags::POLLIN | PollFlags::POLLPRI),
            writable: flags.contains(PollFlags::POLLOUT),
            hangup: flags.contains(PollFlags::POLLHUP),
            error: flags.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL),
        }
    }
}

/// One ready descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub readiness: Readiness,
}

/// OS readiness facility.
pub trait Multiplexer {
    /// Block until at least one registration is ready or `timeout` elapses.
    ///
    /// An empty result means the timeout elapsed. An `Interrupted` error is
    /// retried by the caller; any other error is fatal to the relay.
    fn wait(
        &mut self,
        registrations: &[Registration<'_>],
        timeout: Option<Duration>,
    ) -> io::Result<Vec<Event>>;
}

impl<M: Multiplexer + ?Sized> Multiplexer for &mut M {
    fn wait(
        &mut self,
        registrations: &[Registration<'_>],
        timeout: Option<Duration>,
    ) -> io::Result<Vec<Event>> {
        (**self).wait(registrations, timeout)
    }
}

/// poll(2)-backed multiplexer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollMultiplexer;

impl PollMultiplexer {
    pub const fn new() -> Self {
        Self
    }
}

impl Multiplexer for PollMultiplexer {
    fn wait(
        &mut self,
        registrations: &[Registration<'_>],
        timeout: Option<Duration>,
    ) -> io::Result<Vec<Event>> {
        let mut fds: Vec<PollFd<'_>> = registrations
            .iter()
            .map(|r| PollFd::new(r.fd, poll_flags(r.interest)))
            .collect();

        let ready = poll(&mut fds, poll_timeout(timeout))?;
        if ready == 0 {
            return Ok(Vec::new());
        }

        Ok(fds
            .iter()
            .zip(registrations)
            .filter_map(|(fd, reg)| {
                let revents = fd.revents()?;
                if revents.is_empty() {
                    return None;
                }
                Some(Event {
                    token: reg.token,
                    readiness: Readiness::from(revents),
                })
            })
            .collect())
    }
}

const fn poll_flags(interest: Interest) -> PollFlags {
    match interest {
        Interest::Readable => PollFlags::POLLIN,
        Interest::Writable => PollFlags::POLLOUT,
    }
}

/// Round up to whole milliseconds so a sub-millisecond remainder does not
/// turn into a zero timeout and a busy loop.
fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    let Some(timeout) = timeout else {
        return PollTimeout::NONE;
    };
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    i32::try_from(millis)
        .ok()
        .and_then(|ms| PollTimeout::try_from(ms).ok())
        .unwrap_or(PollTimeout::MAX)
}
