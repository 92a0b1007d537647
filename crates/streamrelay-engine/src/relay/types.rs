//! Relay module types.

use std::borrow::Cow;
use std::io;
use std::time::Duration;

use streamrelay_core::config::RelaySettings;

use crate::capture::{CaptureBuffer, DecodeError, DecodePolicy};
use crate::source::SourceError;
use crate::subprocess::Endpoint;

/// Tuning for a single relay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Bytes requested per read from stdout/stderr.
    pub read_buffer_size: usize,
    /// SIGTERM → SIGKILL grace period on abort.
    pub terminate_grace: Duration,
    /// Overall deadline, measured from the start of the relay.
    pub timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from(&RelaySettings::default())
    }
}

impl From<&RelaySettings> for RelayConfig {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            read_buffer_size: settings.read_buffer_size.max(1),
            terminate_grace: Duration::from_millis(settings.terminate_grace_ms),
            timeout: settings.timeout_secs.map(Duration::from_secs),
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }
}

/// Errors from relay operations.
///
/// A broken pipe on the child's stdin is deliberately absent: it means the
/// child stopped reading, and the relay just closes stdin and carries on.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to spawn child: {reason}")]
    Spawn { reason: String },

    #[error("Child was spawned without a piped {endpoint}")]
    MissingPipe { endpoint: Endpoint },

    #[error("Payload source failed: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Relay cancelled")]
    Cancelled,

    #[error("Relay timed out after {after:?}")]
    TimedOut { after: Duration },

    #[error("Readiness wait failed: {0}")]
    Multiplexer(#[source] io::Error),

    #[error("I/O error on child {endpoint}: {source}")]
    Io {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] io::Error),
}

impl RelayError {
    /// Whether the relay stopped because its caller asked it to.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::TimedOut { .. })
    }
}

/// Outcome of one relay run, produced exactly once.
///
/// With `error: None` the child ran to completion: `exit_code` is its real
/// exit code (possibly non-zero) and `captured` holds everything it wrote.
/// With `Some(error)` neither should be trusted as complete.
#[derive(Debug)]
pub struct RelayResult {
    /// Child exit code; `128 + signo` for signal deaths, -1 if unknown.
    pub exit_code: i32,
    /// Everything read from stdout and stderr.
    pub captured: CaptureBuffer,
    /// Bytes accepted by the child's stdin.
    pub bytes_written: u64,
    pub error: Option<RelayError>,
}

impl RelayResult {
    /// The relay itself succeeded, whatever the child's exit code.
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Captured output as text under `policy`.
    pub fn text(&self, policy: DecodePolicy) -> Result<Cow<'_, str>, DecodeError> {
        self.captured.decode(policy)
    }
}
