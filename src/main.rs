//! connmux - multiplexed TCP connection manager
//!
//! Serves an echo handler on one listening port from a single event loop
//! thread. Signals stop the loop gracefully.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use connmux::{
    config::ConfigManager, ConnectionHandler, EchoHandler, EventLoop, IdleReaper,
    ShutdownCoordinator,
};

/// CLI arguments for connmux
#[derive(Parser, Debug)]
#[command(name = "connmux")]
#[command(about = "connmux - multiplexed TCP connection manager")]
#[command(version)]
#[command(long_about = "
connmux - multiplexed TCP connection manager

Accepts TCP connections on one port and serves all of them from a single
event loop thread. The bundled handler echoes every byte back.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  CONNMUX_PORT             - Listening port (default 14564)
  CONNMUX_BACKLOG          - Listen backlog depth
  CONNMUX_POLL_TIMEOUT     - Readiness wait timeout (e.g., 1s, 250ms)
  CONNMUX_MAX_ACCEPTS      - Accepts per cycle
  CONNMUX_READ_BUFFER_SIZE - Bytes read per connection per cycle
  CONNMUX_IDLE_TIMEOUT     - Close idle connections after (e.g., 5m)
  CONNMUX_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "config.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Port to listen on (overrides config file)
    #[arg(short, long, help = "Port to listen on")]
    pub port: Option<u16>,

    /// Listen backlog depth
    #[arg(long, help = "Pending connection queue depth")]
    pub backlog: Option<u32>,

    /// Readiness wait timeout
    #[arg(long, value_parser = humantime::parse_duration, help = "Readiness wait timeout (e.g., 1s)")]
    pub poll_timeout: Option<Duration>,

    /// Accepts per cycle
    #[arg(long, help = "Maximum connections accepted per cycle")]
    pub max_accepts: Option<usize>,

    /// Idle timeout
    #[arg(long, value_parser = humantime::parse_duration, help = "Close connections idle for this long (e.g., 5m)")]
    pub idle_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error), overrides logging.level
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let log_filter = init_tracing(&args)?;

    info!("Starting connmux v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.port,
        args.backlog,
        args.poll_timeout,
        args.max_accepts,
        args.idle_timeout,
    );
    config.merge_log_level(args.log_level.as_deref(), args.verbose);

    config
        .validate()
        .context("Final configuration validation failed")?;

    apply_log_level(&log_filter, &config.logging.level)?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Port: {}", config.server.port);
        info!("  Backlog: {}", config.server.backlog);
        info!("  Poll timeout: {:?}", config.event_loop.poll_timeout);
        info!(
            "  Max accepts per cycle: {}",
            config
                .event_loop
                .max_accepts_per_cycle
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string())
        );
        info!("  Read buffer size: {} bytes", config.event_loop.read_buffer_size);
        info!("  Idle timeout: {:?}", config.event_loop.idle_timeout);
        return Ok(());
    }

    let handler: Box<dyn ConnectionHandler + Send> = match config.event_loop.idle_timeout {
        Some(timeout) => {
            info!("Idle connections are closed after {:?}", timeout);
            Box::new(IdleReaper::new(EchoHandler::new(), timeout))
        }
        None => Box::new(EchoHandler::new()),
    };

    let mut event_loop = EventLoop::from_config(&config, handler)?;
    let handle = event_loop.handle();
    info!("Listening on {}", event_loop.local_addr());

    let shutdown_coordinator = Arc::new(ShutdownCoordinator::new(config.server.shutdown_timeout));

    let loop_task = tokio::task::spawn_blocking(move || event_loop.run());

    // Subscribe before the signal listener exists so no signal is missed.
    let shutdown_rx = shutdown_coordinator.subscribe();
    let signals = Arc::clone(&shutdown_coordinator);
    let signal_task = tokio::spawn(async move {
        if let Err(e) = signals.listen_for_signals().await {
            error!("Error setting up signal handlers: {}", e);
        }
    });

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    let result = shutdown_coordinator.supervise_loop(shutdown_rx, handle, loop_task).await;
    signal_task.abort();

    info!("Server shutdown complete");
    result
}

type LogFilter = reload::Handle<EnvFilter, Registry>;

/// Initialize tracing/logging
///
/// Until the configuration is loaded the filter comes from `RUST_LOG`, or the
/// CLI level, or `info`. The returned handle swaps in the configured level.
fn init_tracing(args: &CliArgs) -> Result<LogFilter> {
    let log_level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_deref().unwrap_or("info")
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .init();

    Ok(filter_handle)
}

/// Switch to the configured level unless `RUST_LOG` is set
fn apply_log_level(filter: &LogFilter, level: &str) -> Result<()> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return Ok(());
    }

    filter
        .reload(EnvFilter::new(level))
        .context("Failed to apply configured log level")?;
    info!("Log level set to {}", level);
    Ok(())
}
