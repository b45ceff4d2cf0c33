//! Configuration Module
//!
//! Handles configuration loading, validation, and merging of overrides.

pub mod manager;
pub mod types;

pub use manager::ConfigManager;
pub use types::*;
