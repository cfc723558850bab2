//! Logging setup shared by every taskforge binary.

/// Initialize process-wide logging from the environment.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (format, filters).
pub mod tracing;

pub use tracing::{LogConfig, LogFormat, ParseLogFormatError};
