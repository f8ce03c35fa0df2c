//! Common utilities and types shared across minilock

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, LockerConfig};
pub use error::{Error, Result};
pub use utils::{parse_duration, run_protected, spawn_protected, validate_key};
