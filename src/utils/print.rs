//! Logging setup and the `pf_*!` macro family.
//!
//! Every process in the cluster runs the same binary under a different
//! `server_id`; plain `log::info!` lines from a multi-peer test run are
//! impossible to attribute to a peer at a glance. `ME` holds this
//! process's tag and the `pf_*!` macros prefix every line with it.

use std::sync::OnceLock;

/// This process's log tag, set once by [`logger_init`].
static ME: OnceLock<String> = OnceLock::new();

/// Sets the log tag for this process and initializes `env_logger` at the
/// given level. Must be called once, early in `main`.
pub fn logger_init(tag: &str, level: log::LevelFilter) {
    let _ = ME.set(tag.to_string());
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}

/// Returns this process's log tag, or `"?"` if [`logger_init`] has not
/// run yet (e.g. in unit tests that don't set up logging).
pub fn me() -> &'static str {
    ME.get().map(|s| s.as_str()).unwrap_or("?")
}

#[macro_export]
macro_rules! pf_error {
    ($($arg:tt)*) => {
        log::error!("{} | {}", $crate::utils::me(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_warn {
    ($($arg:tt)*) => {
        log::warn!("{} | {}", $crate::utils::me(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_info {
    ($($arg:tt)*) => {
        log::info!("{} | {}", $crate::utils::me(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_debug {
    ($($arg:tt)*) => {
        log::debug!("{} | {}", $crate::utils::me(), format!($($arg)*))
    };
}

#[macro_export]
macro_rules! pf_trace {
    ($($arg:tt)*) => {
        log::trace!("{} | {}", $crate::utils::me(), format!($($arg)*))
    };
}
