//! Conditional logging macros that check a module-level `ENABLE_LOGS` flag,
//! plus the one-time `env_logger` setup used by the binary.
//!
//! Usage:
//! ```ignore
//! // In your module, define the flag first:
//! const ENABLE_LOGS: bool = true;
//!
//! // Then use the macros (they're exported at the crate root):
//! use crate::{log_info, log_warn, log_error};
//!
//! log_info!("This will log if ENABLE_LOGS is true");
//! ```

/// Initialize the global logger. Reads `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log::LevelFilter::Info);
    builder.parse_default_env();
    // A second init (e.g. from tests) is harmless.
    let _ = builder.try_init();
}

/// Macro for conditional info logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

/// Macro for conditional debug logging.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

/// Macro for conditional warn logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

/// Macro for conditional error logging.
/// Checks the `ENABLE_LOGS` const in the calling module.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
