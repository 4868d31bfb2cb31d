//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;

pub use bitmap::Bitmap;
pub use error::MaekawaError;
pub use print::logger_init;

pub(crate) use safetcp::{
    safe_tcp_read, tcp_bind_with_retry, tcp_connect_with_retry, tcp_write_obj,
};
