//! Listening Socket
//!
//! Owns the bound, non-blocking server socket. The socket is built with
//! `socket2` so the backlog depth is under our control, then handed to `mio`
//! for readiness notification.

use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::error::ListenerError;

/// Outcome of a single accept attempt.
#[derive(Debug)]
pub enum Accept {
    /// A new, already non-blocking, client socket.
    Connection(TcpStream, SocketAddr),
    /// Nothing pending. Not a failure.
    WouldBlock,
}

/// The process's listening socket.
#[derive(Debug)]
pub struct Listener {
    inner: Option<TcpListener>,
    local_addr: SocketAddr,
    backlog: u32,
    #[cfg(test)]
    injected_failures: std::cell::Cell<usize>,
}

impl Listener {
    /// Bind to the wildcard address on `port` and start listening.
    pub fn start(port: u16, backlog: u32) -> Result<Self, ListenerError> {
        Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), backlog)
    }

    /// Bind to an explicit address and start listening.
    pub fn bind(addr: SocketAddr, backlog: u32) -> Result<Self, ListenerError> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(ListenerError::SocketCreate)?;

        socket
            .set_reuse_address(true)
            .map_err(ListenerError::Config)?;

        socket
            .bind(&addr.into())
            .map_err(|source| ListenerError::Bind { addr, source })?;

        socket
            .set_nonblocking(true)
            .map_err(ListenerError::Config)?;

        let depth = i32::try_from(backlog).unwrap_or(i32::MAX);
        socket
            .listen(depth)
            .map_err(|source| ListenerError::Bind { addr, source })?;

        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;

        info!("Listening on {} (backlog {})", local_addr, backlog);

        Ok(Self {
            inner: Some(TcpListener::from_std(std_listener)),
            local_addr,
            backlog,
            #[cfg(test)]
            injected_failures: std::cell::Cell::new(0),
        })
    }

    /// Attempt one accept.
    ///
    /// Interrupted calls are retried. A closed listener reports `WouldBlock`.
    pub fn accept(&self) -> io::Result<Accept> {
        let Some(listener) = self.inner.as_ref() else {
            return Ok(Accept::WouldBlock);
        };

        #[cfg(test)]
        if self.injected_failures.get() > 0 {
            self.injected_failures.set(self.injected_failures.get() - 1);
            return Err(io::Error::new(ErrorKind::Other, "too many open files"));
        }

        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);
                    return Ok(Accept::Connection(stream, peer_addr));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Accept::WouldBlock),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Release the listening socket. Calling this again is a no-op.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            info!("Closed listener on {}", self.local_addr);
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Address the socket was bound to (with the real port if 0 was requested).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    /// Make the next `count` accepts fail as if the process ran out of
    /// descriptors.
    #[cfg(test)]
    pub(crate) fn fail_next_accepts(&self, count: usize) {
        self.injected_failures.set(count);
    }

    pub(crate) fn source_mut(&mut self) -> Option<&mut TcpListener> {
        self.inner.as_mut()
    }
}

/// Transient accept failures caused by a peer that gave up before we got to it.
pub(crate) fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_reports_real_port() {
        let listener = Listener::bind(loopback(), 16).unwrap();
        assert!(listener.is_open());
        assert_ne!(listener.port(), 0);
        assert_eq!(listener.backlog(), 16);
    }

    #[test]
    fn test_accept_without_pending_is_would_block() {
        let listener = Listener::bind(loopback(), 16).unwrap();
        assert!(matches!(listener.accept().unwrap(), Accept::WouldBlock));
    }

    #[test]
    fn test_accept_pending_connection() {
        let listener = Listener::bind(loopback(), 16).unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match listener.accept().unwrap() {
                Accept::Connection(_, peer) => {
                    assert_eq!(peer, client.local_addr().unwrap());
                    break;
                }
                Accept::WouldBlock => {
                    assert!(Instant::now() < deadline, "connection never became acceptable");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }

    #[test]
    fn test_bind_conflict_is_bind_error() {
        let first = Listener::bind(loopback(), 16).unwrap();
        // SO_REUSEADDR does not allow a second socket listening on the same port.
        let err = Listener::bind(first.local_addr(), 16).unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }), "got {:?}", err);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut listener = Listener::bind(loopback(), 16).unwrap();
        listener.close();
        listener.close();
        assert!(!listener.is_open());
        assert!(matches!(listener.accept().unwrap(), Accept::WouldBlock));
    }
}
