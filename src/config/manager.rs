//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const ENV_PORT: &str = "CONNMUX_PORT";
const ENV_BACKLOG: &str = "CONNMUX_BACKLOG";
const ENV_POLL_TIMEOUT: &str = "CONNMUX_POLL_TIMEOUT";
const ENV_MAX_ACCEPTS: &str = "CONNMUX_MAX_ACCEPTS";
const ENV_READ_BUFFER_SIZE: &str = "CONNMUX_READ_BUFFER_SIZE";
const ENV_IDLE_TIMEOUT: &str = "CONNMUX_IDLE_TIMEOUT";
const ENV_LOG_LEVEL: &str = "CONNMUX_LOG_LEVEL";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content).context("Invalid TOML")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|key| std::env::var(key).ok())
    }

    /// Apply variables from `lookup` on top of the defaults
    pub fn load_from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let mut config = Config::default();

        if let Some(port) = lookup(ENV_PORT) {
            config.server.port = parse_var(ENV_PORT, &port)?;
        }

        if let Some(backlog) = lookup(ENV_BACKLOG) {
            config.server.backlog = parse_var(ENV_BACKLOG, &backlog)?;
        }

        if let Some(timeout) = lookup(ENV_POLL_TIMEOUT) {
            config.event_loop.poll_timeout = Some(parse_duration_var(ENV_POLL_TIMEOUT, &timeout)?);
        }

        if let Some(max_accepts) = lookup(ENV_MAX_ACCEPTS) {
            config.event_loop.max_accepts_per_cycle = Some(parse_var(ENV_MAX_ACCEPTS, &max_accepts)?);
        }

        if let Some(size) = lookup(ENV_READ_BUFFER_SIZE) {
            config.event_loop.read_buffer_size = parse_var(ENV_READ_BUFFER_SIZE, &size)?;
        }

        if let Some(timeout) = lookup(ENV_IDLE_TIMEOUT) {
            config.event_loop.idle_timeout = Some(parse_duration_var(ENV_IDLE_TIMEOUT, &timeout)?);
        }

        if let Some(log_level) = lookup(ENV_LOG_LEVEL) {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("Invalid {}: {}", name, value))
}

fn parse_duration_var(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).with_context(|| format!("Invalid {}: {}", name, value))
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .context("Server configuration validation failed")?;

        self.validate_event_loop_config()
            .context("Event loop configuration validation failed")?;

        self.validate_logging_config()
            .context("Logging configuration validation failed")?;

        Ok(())
    }

    /// Validate server configuration
    fn validate_server_config(&self) -> Result<()> {
        if self.server.backlog == 0 {
            bail!("backlog must be greater than 0");
        }

        if self.server.backlog > 65535 {
            bail!("backlog cannot exceed 65535");
        }

        if self.server.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        Ok(())
    }

    /// Validate event loop configuration
    fn validate_event_loop_config(&self) -> Result<()> {
        let event_loop = &self.event_loop;

        if event_loop.read_buffer_size < 1024 {
            bail!("read_buffer_size must be at least 1024 bytes");
        }

        if event_loop.read_buffer_size > 16 * 1024 * 1024 {
            bail!("read_buffer_size cannot exceed 16MB");
        }

        if event_loop.events_capacity == 0 {
            bail!("events_capacity must be greater than 0");
        }

        if event_loop.max_accepts_per_cycle == Some(0) {
            bail!("max_accepts_per_cycle must be greater than 0 when set");
        }

        if event_loop.poll_timeout.is_some_and(|t| t.is_zero()) {
            bail!("poll_timeout must be greater than 0 when set");
        }

        if let Some(idle_timeout) = event_loop.idle_timeout {
            if idle_timeout.is_zero() {
                bail!("idle_timeout must be greater than 0 when set");
            }
            if event_loop.poll_timeout.is_none() {
                bail!("idle_timeout requires poll_timeout so idle connections are checked");
            }
        }

        Ok(())
    }

    /// Validate logging configuration
    fn validate_logging_config(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            );
        }

        Ok(())
    }

    /// Apply a log level given on the command line. `--verbose` wins.
    pub fn merge_log_level(&mut self, level: Option<&str>, verbose: bool) {
        let level = if verbose { Some("debug") } else { level };
        if let Some(level) = level {
            self.logging.level = level.to_string();
            tracing::info!("CLI override: log level set to {}", level);
        }
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        port: Option<u16>,
        backlog: Option<u32>,
        poll_timeout: Option<Duration>,
        max_accepts: Option<usize>,
        idle_timeout: Option<Duration>,
    ) {
        if let Some(port) = port {
            self.server.port = port;
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(backlog) = backlog {
            self.server.backlog = backlog;
            tracing::info!("CLI override: backlog set to {}", backlog);
        }

        if let Some(timeout) = poll_timeout {
            self.event_loop.poll_timeout = Some(timeout);
            tracing::info!("CLI override: poll timeout set to {:?}", timeout);
        }

        if let Some(max_accepts) = max_accepts {
            self.event_loop.max_accepts_per_cycle = Some(max_accepts);
            tracing::info!("CLI override: max accepts per cycle set to {}", max_accepts);
        }

        if let Some(timeout) = idle_timeout {
            self.event_loop.idle_timeout = Some(timeout);
            tracing::info!("CLI override: idle timeout set to {:?}", timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, crate::config::DEFAULT_PORT);
        assert_eq!(config.event_loop.max_accepts_per_cycle, None);
        assert_eq!(config.event_loop.idle_timeout, None);
    }

    #[test]
    fn test_env_overrides() {
        let config = ConfigManager::load_from_vars(vars(&[
            (ENV_PORT, "9000"),
            (ENV_BACKLOG, "64"),
            (ENV_POLL_TIMEOUT, "250ms"),
            (ENV_MAX_ACCEPTS, "32"),
            (ENV_IDLE_TIMEOUT, "2m"),
            (ENV_LOG_LEVEL, "debug"),
        ]))
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.event_loop.poll_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.event_loop.max_accepts_per_cycle, Some(32));
        assert_eq!(config.event_loop.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = ConfigManager::load_from_vars(vars(&[(ENV_PORT, "not-a-port")])).unwrap_err();
        assert!(err.to_string().contains(ENV_PORT));

        assert!(ConfigManager::load_from_vars(vars(&[(ENV_POLL_TIMEOUT, "soon")])).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.server.backlog = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.event_loop.read_buffer_size = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.event_loop.max_accepts_per_cycle = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.event_loop.poll_timeout = None;
        config.event_loop.idle_timeout = Some(Duration::from_secs(30));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = Config::default();
        config.merge_with_cli_args(
            Some(1234),
            Some(8),
            Some(Duration::from_millis(100)),
            Some(4),
            None,
        );

        assert_eq!(config.server.port, 1234);
        assert_eq!(config.server.backlog, 8);
        assert_eq!(config.event_loop.poll_timeout, Some(Duration::from_millis(100)));
        assert_eq!(config.event_loop.max_accepts_per_cycle, Some(4));
        assert_eq!(config.event_loop.idle_timeout, None);
    }

    #[test]
    fn test_log_level_sources() {
        let mut config = ConfigManager::load_from_vars(vars(&[(ENV_LOG_LEVEL, "warn")])).unwrap();
        config.merge_log_level(None, false);
        assert_eq!(config.logging.level, "warn");

        config.merge_log_level(Some("trace"), false);
        assert_eq!(config.logging.level, "trace");

        config.merge_log_level(Some("error"), true);
        assert_eq!(config.logging.level, "debug");
    }
}
