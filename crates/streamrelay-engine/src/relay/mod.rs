//! Relay module: drives a chunk source into a child while draining its output.
//!
//! Data flow:
//! ```text
//! ChunkSource → pending chunk → child stdin
//! child stdout ┐
//!              ├→ CaptureBuffer
//! child stderr ┘
//! ```

mod interest;
mod pipeline;
mod types;

pub use interest::InterestSet;
pub use pipeline::StreamRelay;
pub use types::*;
