//! Caller-issued cancellation for a running relay.
//!
//! A [`RelayCancel`] pairs a [`CancellationToken`] with a socket pair. The
//! relay watches the read side next to the child's pipes, so `cancel()` wakes
//! a readiness wait that would otherwise block indefinitely.

use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct WakePair {
    tx: UnixStream,
    rx: UnixStream,
}

/// Cloneable cancellation handle. All clones share one state.
#[derive(Debug, Clone)]
pub struct RelayCancel {
    token: CancellationToken,
    wake: Arc<WakePair>,
}

impl RelayCancel {
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok(Self {
            token: CancellationToken::new(),
            wake: Arc::new(WakePair { tx, rx }),
        })
    }

    /// Request cancellation and wake any relay waiting on this handle.
    pub fn cancel(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        // A full buffer means a wake byte is already pending.
        if let Err(e) = (&self.wake.tx).write(&[1])
            && e.kind() != io::ErrorKind::WouldBlock
        {
            debug!(error = %e, "Failed to write cancellation wake byte");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel this handle once `parent` is cancelled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn cancel_on(&self, parent: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let relay_token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = parent.cancelled() => this.cancel(),
                () = relay_token.cancelled() => {}
            }
        })
    }

    /// Descriptor that turns readable once `cancel()` has been called.
    pub(crate) fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake.rx.as_fd()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::multiplexer::{Interest, Multiplexer, PollMultiplexer, Registration, Token};
    use std::time::Duration;

    #[test]
    fn cancel_is_shared_between_clones() {
        let cancel = RelayCancel::new().unwrap();
        let clone = cancel.clone();
        assert!(!clone.is_cancelled());
        cancel.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_wakes_a_readiness_wait() {
        let cancel = RelayCancel::new().unwrap();
        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let regs = [Registration {
            token: Token::Wake,
            fd: cancel.wake_fd(),
            interest: Interest::Readable,
        }];
        let events = PollMultiplexer::new()
            .wait(&regs, Some(Duration::from_secs(10)))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, Token::Wake);
        canceller.join().unwrap();
    }

    #[test]
    fn repeated_cancel_is_harmless() {
        let cancel = RelayCancel::new().unwrap();
        for _ in 0..10_000 {
            cancel.cancel();
        }
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn parent_token_cancels_relay_handle() {
        let parent = CancellationToken::new();
        let cancel = RelayCancel::new().unwrap();
        let link = cancel.cancel_on(parent.clone());

        parent.cancel();
        link.await.unwrap();
        assert!(cancel.is_cancelled());
    }
}
