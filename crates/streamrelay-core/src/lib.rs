//! `StreamRelay` Core Library
//!
//! Shared functionality for `StreamRelay` components:
//! - Configuration resolution and hierarchy
//! - Tracing subscriber setup
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, DecodeMode, RelaySettings};
pub use error::{Error, Result};
