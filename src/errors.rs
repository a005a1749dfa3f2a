//! Crate-wide error type: a thin alias over a dynamically typed failure
//! rather than a hand-rolled enum per module.

pub use failure::err_msg;
pub use failure::format_err;
pub use failure::Error;

pub type Result<T> = std::result::Result<T, Error>;
