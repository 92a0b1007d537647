//! `StreamRelay` CLI
//!
//! Library half of the `streamrelay` binary:
//! - Payload origins (file, stdin, HTTP URL)
//! - Streaming HTTP fetch into a relay source
//! - Plain and JSON rendering of relay results

pub mod fetch;
pub mod payload;
pub mod report;
