//! Error Types
//!
//! Startup and loop-level failures are typed; per-connection failures are not
//! errors at this level at all, they become a [`CloseReason`] for the one
//! connection involved.
//!
//! [`CloseReason`]: crate::connection::CloseReason

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Failure to bring up the listening socket. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The socket itself could not be allocated.
    #[error("failed to create socket: {0}")]
    SocketCreate(#[source] io::Error),

    /// The address or port is unavailable, or `listen` was refused.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A socket option (non-blocking mode, address reuse) could not be set.
    #[error("failed to configure socket: {0}")]
    Config(#[source] io::Error),
}

/// Failure of the event loop as a whole. Open connections are closed
/// best-effort before one of these is returned.
#[derive(Debug, Error)]
pub enum LoopError {
    /// The readiness primitive could not be created.
    #[error("failed to create readiness backend: {0}")]
    Backend(#[source] io::Error),

    /// The readiness primitive itself failed.
    #[error("readiness wait failed: {0}")]
    ReadinessWait(#[source] io::Error),

    /// The listener could not be added to the watch list.
    #[error("failed to watch listener: {0}")]
    ListenerRegistration(#[source] io::Error),

    /// The cross-thread wake-up channel could not be created.
    #[error("failed to create loop notifier: {0}")]
    Notifier(#[source] io::Error),
}

impl LoopError {
    /// The underlying I/O error.
    pub fn io_error(&self) -> &io::Error {
        match self {
            LoopError::Backend(e)
            | LoopError::ReadinessWait(e)
            | LoopError::ListenerRegistration(e)
            | LoopError::Notifier(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_names_address() {
        let err = ListenerError::Bind {
            addr: "0.0.0.0:14564".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.0.0.0:14564"), "unexpected message: {}", msg);
    }

    #[test]
    fn test_loop_error_exposes_io_kind() {
        let err = LoopError::ReadinessWait(io::Error::from(io::ErrorKind::OutOfMemory));
        assert_eq!(err.io_error().kind(), io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_backend_setup_is_not_a_wait_failure() {
        let err = LoopError::Backend(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(err.to_string().starts_with("failed to create readiness backend"));
        assert_eq!(err.io_error().kind(), io::ErrorKind::PermissionDenied);
    }
}
