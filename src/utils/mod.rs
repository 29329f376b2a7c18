//! Helper utilities, functions, and macros shared by every component.

#[macro_use]
mod print;

mod error;
mod safetcp;
mod timer;

pub use error::RelayError;
pub use print::{logger_init, me};
pub use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, MAX_FRAME_SIZE,
};
pub use timer::Timer;
