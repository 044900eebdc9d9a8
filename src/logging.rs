//! Logging utilities for the interop subsystem.
//!
//! Uses `tracing` for structured logging with minimal overhead on the call
//! path; everything below info level compiles out of release builds that
//! filter it.

// Re-export tracing macros for use throughout the crate
pub use tracing::{debug, error, trace, warn};

/// Initialize logging with sensible defaults.
///
/// Honors `RUST_LOG` when set; otherwise logs at info level (debug in debug
/// builds). Safe to call more than once.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            EnvFilter::new("dynacall=debug")
        }
        #[cfg(not(debug_assertions))]
        {
            EnvFilter::new("dynacall=info")
        }
    });

    fmt()
        .with_env_filter(filter)
        .compact()
        .try_init()
        .ok(); // Ignore error if already initialized
}

/// Log a completed native call.
#[inline]
pub fn log_call_complete(arity: usize, success: bool) {
    trace!(target: "call", arity, success, "native call complete");
}

/// Log a marshalling failure.
#[inline]
pub fn log_marshal_error(index: usize, error: &str) {
    debug!(target: "marshal", index, error, "argument failed to marshal");
}

/// Log a callback invocation.
#[inline]
pub fn log_callback(cross_thread: bool) {
    trace!(target: "callback", cross_thread, "callback invoked");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_helpers_do_not_panic() {
        log_call_complete(2, true);
        log_marshal_error(0, "out of range");
        log_callback(false);
    }
}
