//! Shared utilities for NeonIPC components.
//!
//! This crate provides the configuration model and logging setup used by
//! both the broker daemon and the `neonctl` producer tool.

pub mod config;
pub mod logging;

// Re-export commonly used items for convenience
pub use config::{ChannelKind, Config, ConfigError, SecurityLevel};
