//! Crate-wide error type.

use std::fmt;
use std::io;

/// Catch-all error type carried across the whole crate. Modeled as a
/// single string-carrying variant rather than an enum-per-cause: almost
/// every error here is either "network I/O failed" or "a protocol
/// invariant was violated", and both are handled identically by callers
/// (log and move on, or propagate with `?`).
#[derive(Debug, Clone)]
pub struct RelayError(String);

impl RelayError {
    pub fn new<S: Into<String>>(msg: S) -> Self {
        RelayError(msg.into())
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RelayError {}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        RelayError(format!("io error: {}", e))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError(format!("json error: {}", e))
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(e: toml::de::Error) -> Self {
        RelayError(format!("config parse error: {}", e))
    }
}

/// Formats a message, logs it at `error` level, and evaluates to
/// `Err(RelayError::new(..))`. Keeps the log line and the error return
/// at the same call site so a propagated error is never silent.
#[macro_export]
macro_rules! logged_err {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::pf_error!("{}", msg);
        Err($crate::utils::RelayError::new(msg))
    }};
}
