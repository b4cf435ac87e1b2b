//! Configuration module
//!
//! Loads and validates the TOML server configuration.

mod settings;

pub use settings::*;
