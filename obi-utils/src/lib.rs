#![deny(clippy::all)]

pub mod crypto;
pub mod math;
pub mod os_cmd;
pub mod retry;
pub mod tracing;
