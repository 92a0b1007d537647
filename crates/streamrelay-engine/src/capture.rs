//! Capture buffer for the child's stdout and stderr.
//!
//! Bytes are kept raw. Turning them into text is a separate step with an
//! explicit [`DecodePolicy`], so binary output never aborts a relay.

use std::borrow::Cow;

use crate::subprocess::Endpoint;

/// How to decode captured bytes as UTF-8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodePolicy {
    /// Fail on the first invalid sequence.
    Strict,
    /// Substitute U+FFFD for invalid sequences.
    #[default]
    Lossy,
}

/// Captured output is not valid UTF-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Captured output is not valid UTF-8 (valid up to byte {valid_up_to})")]
pub struct DecodeError {
    pub valid_up_to: usize,
}

/// Append-only accumulator of stdout and stderr bytes in read order.
///
/// Order within one stream matches the child's write order. Interleaving
/// between the two streams follows readiness and is not otherwise defined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureBuffer {
    bytes: Vec<u8>,
    stdout_len: usize,
    stderr_len: usize,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from `endpoint`.
    pub fn append(&mut self, endpoint: Endpoint, data: &[u8]) {
        match endpoint {
            Endpoint::Output => self.stdout_len += data.len(),
            Endpoint::Error => self.stderr_len += data.len(),
            Endpoint::Input => {
                debug_assert!(false, "stdin is never captured");
                return;
            }
        }
        self.bytes.extend_from_slice(data);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes that came from stdout.
    pub const fn stdout_len(&self) -> usize {
        self.stdout_len
    }

    /// Bytes that came from stderr.
    pub const fn stderr_len(&self) -> usize {
        self.stderr_len
    }

    /// Decode the capture as text under `policy`.
    pub fn decode(&self, policy: DecodePolicy) -> Result<Cow<'_, str>, DecodeError> {
        match policy {
            DecodePolicy::Strict => std::str::from_utf8(&self.bytes)
                .map(Cow::Borrowed)
                .map_err(|e| DecodeError {
                    valid_up_to: e.valid_up_to(),
                }),
            DecodePolicy::Lossy => Ok(String::from_utf8_lossy(&self.bytes)),
        }
    }
}
