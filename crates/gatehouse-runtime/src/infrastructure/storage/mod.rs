//! Storage infrastructure: TOML configuration persistence.

pub mod config;

pub use config::{AppConfig, ConfigError};
