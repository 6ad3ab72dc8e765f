#![deny(clippy::all)]

pub mod config;
pub mod data;
pub mod engine;
pub mod exec;
pub mod lang;
pub mod registry;
pub mod verdict;

pub use self::config::Config;
pub use self::engine::{EnqueueError, JudgeEngine};
pub use self::registry::Registry;
