//! Process-wide tracing setup shared by herald binaries.

/// Initialize process-wide tracing using `RUST_LOG` and `HERALD_LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogFormat;
