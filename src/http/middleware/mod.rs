//! Middleware applied to every client request.

pub mod access_log;

pub use access_log::{access_log, AccessLog};
