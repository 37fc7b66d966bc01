//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;
mod timer;

pub use error::CopilotError;
pub use print::{logger_init, ME};
pub use timer::Timer;

pub(crate) use safetcp::tcp_connect_with_retry;
