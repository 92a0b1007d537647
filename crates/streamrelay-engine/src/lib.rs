//! `StreamRelay` Engine
//!
//! Relays a streamed payload into a child process's stdin while draining its
//! stdout and stderr, from a single readiness loop:
//! - Chunk sources (readers, iterators, async channels)
//! - Child process handles with closable pipe endpoints
//! - poll(2)-backed readiness multiplexing
//! - The relay loop itself, with cancellation and deadlines

pub mod cancel;
pub mod capture;
pub mod multiplexer;
pub mod relay;
pub mod source;
pub mod subprocess;

pub use cancel::RelayCancel;
pub use capture::{CaptureBuffer, DecodeError, DecodePolicy};
pub use multiplexer::{Multiplexer, PollMultiplexer};
pub use relay::{RelayConfig, RelayError, RelayResult, StreamRelay};
pub use source::{ChannelSource, ChunkSource, IterSource, ReaderSource, SourceError};
pub use subprocess::{ChildHandle, Endpoint};
