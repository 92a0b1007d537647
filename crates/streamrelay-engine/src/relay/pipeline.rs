//! The relay loop.
//!
//! One thread, one readiness wait per iteration. Between waits every
//! operation is non-blocking: descriptors are `O_NONBLOCK` and only touched
//! after the multiplexer reported them ready. The loop ends when the
//! interest set is empty; only then is the child waited on.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, warn};

use super::interest::InterestSet;
use super::types::{RelayConfig, RelayError, RelayResult};
use crate::cancel::RelayCancel;
use crate::capture::CaptureBuffer;
use crate::multiplexer::{Event, Interest, Multiplexer, PollMultiplexer, Registration, Token};
use crate::source::ChunkSource;
use crate::subprocess::{ChildHandle, Endpoint};

/// Relays a chunk source into a child's stdin while capturing its output.
#[derive(Debug)]
pub struct StreamRelay<M = PollMultiplexer> {
    config: RelayConfig,
    multiplexer: M,
}

impl StreamRelay<PollMultiplexer> {
    /// Create a relay backed by poll(2).
    pub const fn new(config: RelayConfig) -> Self {
        Self {
            config,
            multiplexer: PollMultiplexer::new(),
        }
    }

    /// Run a relay on tokio's blocking pool.
    ///
    /// Dropping the returned future cancels the relay; the blocking task then
    /// terminates the child and finishes on its own.
    pub async fn relay_async<S>(
        config: RelayConfig,
        mut handle: ChildHandle,
        mut source: S,
        cancel: RelayCancel,
    ) -> Result<RelayResult, tokio::task::JoinError>
    where
        S: ChunkSource + Send + 'static,
    {
        let guard = CancelOnDrop(Some(cancel.clone()));
        let span = tracing::Span::current();
        let result = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            Self::new(config).relay_with_cancel(&mut handle, &mut source, &cancel)
        })
        .await;
        guard.disarm();
        result
    }
}

impl<M: Multiplexer> StreamRelay<M> {
    /// Create a relay over a caller-supplied multiplexer.
    pub const fn with_multiplexer(config: RelayConfig, multiplexer: M) -> Self {
        Self {
            config,
            multiplexer,
        }
    }

    /// Relay `source` into `handle` until the child's pipes are all closed,
    /// then wait for it.
    pub fn relay<S>(&mut self, handle: &mut ChildHandle, source: &mut S) -> RelayResult
    where
        S: ChunkSource + ?Sized,
    {
        self.run(handle, source, None)
    }

    /// Like [`relay`](Self::relay), aborting when `cancel` fires.
    pub fn relay_with_cancel<S>(
        &mut self,
        handle: &mut ChildHandle,
        source: &mut S,
        cancel: &RelayCancel,
    ) -> RelayResult
    where
        S: ChunkSource + ?Sized,
    {
        self.run(handle, source, Some(cancel))
    }

    fn run<S>(
        &mut self,
        handle: &mut ChildHandle,
        source: &mut S,
        cancel: Option<&RelayCancel>,
    ) -> RelayResult
    where
        S: ChunkSource + ?Sized,
    {
        let relay_id = uuid::Uuid::new_v4();
        let span = info_span!("relay", %relay_id, pid = handle.id());
        let _entered = span.enter();

        let started = Instant::now();
        let deadline = self.config.timeout.and_then(|t| started.checked_add(t));
        info!(timeout = ?self.config.timeout, "Starting relay");

        let mut pump = Pump::new(handle, source, self.config.read_buffer_size);
        let outcome = pump
            .drive(&mut self.multiplexer, cancel, deadline, self.config.timeout)
            .and_then(|()| pump.await_exit(cancel, deadline, self.config.timeout));
        pump.finish(outcome, self.config.terminate_grace, started)
    }
}

/// Cancels the relay if the async caller goes away mid-run.
struct CancelOnDrop(Option<RelayCancel>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            debug!("Relay future dropped, cancelling");
            cancel.cancel();
        }
    }
}

/// Payload bytes taken from the source but not yet accepted by stdin.
#[derive(Debug, Default)]
struct PendingWrite {
    chunk: Vec<u8>,
    offset: usize,
}

impl PendingWrite {
    fn remaining(&self) -> &[u8] {
        &self.chunk[self.offset..]
    }

    const fn is_empty(&self) -> bool {
        self.offset >= self.chunk.len()
    }

    fn replace(&mut self, chunk: Vec<u8>) {
        debug_assert!(self.is_empty(), "pending bytes would be dropped");
        self.chunk = chunk;
        self.offset = 0;
    }

    fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.chunk.len());
    }

    fn clear(&mut self) {
        self.chunk.clear();
        self.offset = 0;
    }
}

/// State of one relay run.
struct Pump<'a, S: ?Sized> {
    handle: &'a mut ChildHandle,
    source: &'a mut S,
    interest: InterestSet,
    pending: PendingWrite,
    capture: CaptureBuffer,
    read_buf: Vec<u8>,
    bytes_written: u64,
}

impl<'a, S> Pump<'a, S>
where
    S: ChunkSource + ?Sized,
{
    fn new(handle: &'a mut ChildHandle, source: &'a mut S, read_buffer_size: usize) -> Self {
        Self {
            handle,
            source,
            interest: InterestSet::full(),
            pending: PendingWrite::default(),
            capture: CaptureBuffer::new(),
            read_buf: vec![0u8; read_buffer_size.max(1)],
            bytes_written: 0,
        }
    }

    /// Run the readiness loop until the interest set is empty.
    fn drive<M: Multiplexer>(
        &mut self,
        multiplexer: &mut M,
        cancel: Option<&RelayCancel>,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Result<(), RelayError> {
        // Endpoints the caller already closed are not watched.
        for endpoint in Endpoint::ALL {
            if !self.handle.is_open(endpoint) {
                self.interest.remove(endpoint);
            }
        }
        self.handle.set_nonblocking()?;

        while !self.interest.is_empty() {
            if cancel.is_some_and(RelayCancel::is_cancelled) {
                return Err(RelayError::Cancelled);
            }
            let wait_for = match remaining(deadline) {
                Some(Duration::ZERO) => return Err(timed_out(timeout)),
                other => other,
            };

            let events = {
                let registrations = self.registrations(cancel);
                match multiplexer.wait(&registrations, wait_for) {
                    Ok(events) => events,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        debug!("Readiness wait interrupted, retrying");
                        continue;
                    }
                    Err(e) => return Err(RelayError::Multiplexer(e)),
                }
            };

            for event in events {
                self.dispatch(event)?;
            }
        }

        debug!(
            bytes_written = self.bytes_written,
            captured = self.capture.len(),
            "All endpoints closed"
        );
        Ok(())
    }

    fn registrations<'s>(&'s self, cancel: Option<&'s RelayCancel>) -> Vec<Registration<'s>> {
        let mut registrations: Vec<Registration<'s>> = self
            .interest
            .iter()
            .filter_map(|endpoint| {
                self.handle.fd(endpoint).map(|fd| Registration {
                    token: Token::Endpoint(endpoint),
                    fd,
                    interest: InterestSet::interest_for(endpoint),
                })
            })
            .collect();
        if let Some(cancel) = cancel {
            registrations.push(Registration {
                token: Token::Wake,
                fd: cancel.wake_fd(),
                interest: Interest::Readable,
            });
        }
        registrations
    }

    fn dispatch(&mut self, event: Event) -> Result<(), RelayError> {
        let Token::Endpoint(endpoint) = event.token else {
            // Wake byte: the cancellation check at the top of the loop acts on it.
            return Ok(());
        };
        if !self.interest.contains(endpoint) {
            return Ok(());
        }
        let interest = InterestSet::interest_for(endpoint);
        if !event.readiness.satisfies(interest) {
            return Ok(());
        }
        match endpoint {
            Endpoint::Input => self.on_writable(),
            Endpoint::Output | Endpoint::Error => self.on_readable(endpoint),
        }
    }

    /// Stdin is writable: top up the pending chunk and write what fits.
    fn on_writable(&mut self) -> Result<(), RelayError> {
        if self.pending.is_empty() {
            match self.source.next_chunk() {
                Ok(Some(chunk)) if !chunk.is_empty() => self.pending.replace(chunk),
                Ok(_) => {
                    debug!(bytes_written = self.bytes_written, "Source exhausted");
                    self.close(Endpoint::Input);
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "Source failed mid-stream");
                    return Err(RelayError::Source(e));
                }
            }
        }

        match self.handle.write_input(self.pending.remaining()) {
            Ok(n) => {
                self.pending.advance(n);
                self.bytes_written += n as u64;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(
                    unwritten = self.pending.remaining().len(),
                    "Child closed stdin early"
                );
                self.pending.clear();
                self.close(Endpoint::Input);
            }
            Err(source) => {
                return Err(RelayError::Io {
                    endpoint: Endpoint::Input,
                    source,
                });
            }
        }
        Ok(())
    }

    /// Stdout or stderr is readable: drain it until it would block.
    fn on_readable(&mut self, endpoint: Endpoint) -> Result<(), RelayError> {
        loop {
            match self.handle.read_endpoint(endpoint, &mut self.read_buf) {
                Ok(0) => {
                    self.close(endpoint);
                    return Ok(());
                }
                Ok(n) => self.capture.append(endpoint, &self.read_buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => return Err(RelayError::Io { endpoint, source }),
            }
        }
    }

    fn close(&mut self, endpoint: Endpoint) {
        if self.interest.remove(endpoint) {
            self.handle.close(endpoint);
            debug!(%endpoint, remaining = self.interest.len(), "Endpoint done");
        }
    }

    /// Wait for the child once every endpoint is closed.
    fn await_exit(
        &mut self,
        cancel: Option<&RelayCancel>,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Result<i32, RelayError> {
        debug_assert!(self.interest.is_empty());
        debug_assert_eq!(self.handle.open_count(), 0);

        if cancel.is_none() && deadline.is_none() {
            return self.handle.wait().map_err(RelayError::Wait);
        }
        let stop = || cancel.is_some_and(RelayCancel::is_cancelled);
        match self.handle.wait_until(deadline, &stop) {
            Ok(Some(code)) => Ok(code),
            Ok(None) if stop() => Err(RelayError::Cancelled),
            Ok(None) => Err(timed_out(timeout)),
            Err(e) => Err(RelayError::Wait(e)),
        }
    }

    fn finish(
        self,
        outcome: Result<i32, RelayError>,
        grace: Duration,
        started: Instant,
    ) -> RelayResult {
        let (exit_code, error) = match outcome {
            Ok(code) => (code, None),
            Err(RelayError::Wait(e)) => {
                warn!(error = %e, "Failed to wait for child");
                (-1, Some(RelayError::Wait(e)))
            }
            Err(err) => {
                warn!(error = %err, "Relay aborted, terminating child");
                self.handle.close_all();
                let code = match self.handle.terminate(grace) {
                    Ok(code) => code,
                    Err(e) => {
                        warn!(error = %e, "Failed to terminate child");
                        -1
                    }
                };
                (code, Some(err))
            }
        };

        info!(
            exit_code,
            bytes_written = self.bytes_written,
            captured = self.capture.len(),
            stdout = self.capture.stdout_len(),
            stderr = self.capture.stderr_len(),
            elapsed_ms = started.elapsed().as_millis(),
            ok = error.is_none(),
            "Relay finished"
        );

        RelayResult {
            exit_code,
            captured: self.capture,
            bytes_written: self.bytes_written,
            error,
        }
    }
}

/// Time left until `deadline`, saturating at zero.
fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

fn timed_out(timeout: Option<Duration>) -> RelayError {
    RelayError::TimedOut {
        after: timeout.unwrap_or_default(),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pending_write_tracks_partial_progress() {
        let mut pending = PendingWrite::default();
        assert!(pending.is_empty());

        pending.replace(b"abcdef".to_vec());
        pending.advance(4);
        assert_eq!(pending.remaining(), b"ef");
        assert!(!pending.is_empty());

        pending.advance(2);
        assert!(pending.is_empty());
        assert!(pending.remaining().is_empty());
    }

    #[test]
    fn pending_write_clear_discards_remainder() {
        let mut pending = PendingWrite::default();
        pending.replace(b"xyz".to_vec());
        pending.clear();
        assert!(pending.is_empty());
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let past = Instant::now().checked_sub(Duration::from_secs(1)).unwrap();
        assert_eq!(remaining(Some(past)), Some(Duration::ZERO));
        assert_eq!(remaining(None), None);
    }
}
