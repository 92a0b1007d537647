//! The set of endpoints the relay loop still watches.

use crate::multiplexer::Interest;
use crate::subprocess::Endpoint;

/// Explicit per-endpoint membership.
///
/// The set starts full and only shrinks: there is no way to add an endpoint
/// back once it has been removed. The relay loop runs while it is non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestSet {
    input: bool,
    output: bool,
    error: bool,
}

impl InterestSet {
    /// Stdin for writability, stdout and stderr for readability.
    pub const fn full() -> Self {
        Self {
            input: true,
            output: true,
            error: true,
        }
    }

    pub const fn contains(&self, endpoint: Endpoint) -> bool {
        match endpoint {
            Endpoint::Input => self.input,
            Endpoint::Output => self.output,
            Endpoint::Error => self.error,
        }
    }

    /// Remove `endpoint`. Returns whether it was still a member.
    pub const fn remove(&mut self, endpoint: Endpoint) -> bool {
        let slot = match endpoint {
            Endpoint::Input => &mut self.input,
            Endpoint::Output => &mut self.output,
            Endpoint::Error => &mut self.error,
        };
        let was_member = *slot;
        *slot = false;
        was_member
    }

    pub const fn len(&self) -> usize {
        self.input as usize + self.output as usize + self.error as usize
    }

    pub const fn is_empty(&self) -> bool {
        !(self.input || self.output || self.error)
    }

    /// Members in a fixed order.
    pub fn iter(&self) -> impl Iterator<Item = Endpoint> + '_ {
        Endpoint::ALL.into_iter().filter(|e| self.contains(*e))
    }

    /// The readiness condition watched for `endpoint`.
    pub const fn interest_for(endpoint: Endpoint) -> Interest {
        match endpoint {
            Endpoint::Input => Interest::Writable,
            Endpoint::Output | Endpoint::Error => Interest::Readable,
        }
    }
}

impl Default for InterestSet {
    fn default() -> Self {
        Self::full()
    }
}
