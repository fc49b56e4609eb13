//! Primordia logging facade.
//!
//! This crate is only a facade of the `log` crate, so that callers do not
//! depend on a particular logger implementation. The binary decides which
//! logger backend to install.

pub use log::{debug, error, info, log_enabled, trace, warn, Level};

/// Checks if the trace level is enabled for the default target.
pub fn trace_enabled() -> bool {
    log_enabled!(Level::Trace)
}
