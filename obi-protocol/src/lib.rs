#![deny(clippy::all)]

pub mod common;
pub mod error;
pub mod external;
