//! Logging setup

pub use log::{debug, error, info, trace, warn};

/// Initialize `env_logger` at `info`, overridable through `RUST_LOG`
pub fn init() {
    init_with_level(log::LevelFilter::Info);
}

/// Initialize `env_logger` with a default level, overridable through `RUST_LOG`
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}
