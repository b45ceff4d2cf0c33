//! connmux
//!
//! A single-threaded, multiplexed TCP connection manager. One non-blocking
//! listener, a set of accepted connections, and a readiness cycle that
//! accepts, reads, writes and closes them. What the bytes mean is left to a
//! [`ConnectionHandler`].

pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod listener;
pub mod poller;
pub mod reaper;
pub mod shutdown;

pub use config::Config;
pub use connection::{CloseReason, ConnectionId, ConnectionState, Control};
pub use error::{ListenerError, LoopError};
pub use event_loop::{CycleReport, EventLoop, LoopHandle, LoopOptions, LoopStats};
pub use handler::{ConnectionHandler, EchoHandler};
pub use listener::{Accept, Listener};
pub use reaper::IdleReaper;
pub use shutdown::ShutdownCoordinator;

/// Common error type at the application edge
pub type Result<T> = anyhow::Result<T>;
