pub mod logging;

pub use logging::init_logging;

/// Current wall-clock time as whole seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
