//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Port the server listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 14564;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub event_loop: EventLoopConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listening socket configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port on the wildcard interface
    pub port: u16,
    /// Pending-connection queue depth passed to `listen`
    pub backlog: u32,
    /// How long the binary waits for the loop to wind down after a signal
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Event loop tuning
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Upper bound on one readiness wait, which also paces housekeeping ticks
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Option<Duration>,
    /// Accepts per cycle; omitted means accept until the listener would block
    pub max_accepts_per_cycle: Option<usize>,
    /// Bytes read from one connection per cycle
    pub read_buffer_size: usize,
    /// Readiness events fetched per wait
    pub events_capacity: usize,
    /// Close connections without activity for this long; omitted disables it
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            event_loop: EventLoopConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backlog: 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Some(Duration::from_secs(1)),
            max_accepts_per_cycle: None,
            read_buffer_size: 64 * 1024,
            events_capacity: 1024,
            idle_timeout: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
