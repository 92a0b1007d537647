//! Child process plumbing: pipe endpoints, exit status, termination.

pub mod handle;
pub mod signal;

pub use handle::{ChildHandle, Endpoint};
pub use signal::exit_code;
