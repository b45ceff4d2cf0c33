//! Per-connection state owned by the registry.

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::trace;

/// Opaque connection identifier handed to protocol handlers.
///
/// Identifiers are never reused within one event loop, so a handler holding a
/// stale id cannot address a later connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) usize);

impl ConnectionId {
    pub fn as_usize(self) -> usize {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }
}

impl From<Token> for ConnectionId {
    fn from(token: Token) -> Self {
        ConnectionId(token.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Why a connection left the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly shutdown by the peer (zero-length read).
    PeerClosed,
    ReadError(ErrorKind),
    WriteError(ErrorKind),
    /// Closed through [`Control::close`](super::Control::close).
    Requested,
    /// Closed by the idle reaper.
    IdleTimeout,
    /// The socket could not be (re)registered with the watch list.
    Registration(ErrorKind),
    /// The event loop is stopping.
    Shutdown,
}

impl CloseReason {
    /// Whether the socket is known to be broken, so no final flush is attempted.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CloseReason::ReadError(_) | CloseReason::WriteError(_) | CloseReason::Registration(_)
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::ReadError(kind) => write!(f, "read error: {}", kind),
            CloseReason::WriteError(kind) => write!(f, "write error: {}", kind),
            CloseReason::Requested => write!(f, "close requested"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Registration(kind) => write!(f, "registration failed: {}", kind),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Lifecycle of a connection. `Closed` is reached by removal from the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted in the current cycle, no I/O yet.
    Accepted,
    Active,
    Closing(CloseReason),
}

/// Result of a bounded read.
#[derive(Debug)]
pub(crate) enum ReadStatus {
    /// Socket drained to `WouldBlock`.
    Drained,
    /// The read budget filled up; more input may be pending.
    Exhausted,
    PeerClosed,
    Failed(io::Error),
}

/// Result of draining the output queue.
#[derive(Debug)]
pub(crate) enum FlushStatus {
    /// Queue is empty.
    Complete,
    /// Socket stopped accepting bytes; the rest stays queued.
    Partial,
    Failed(io::Error),
}

/// A single accepted client, owned exclusively by the [`ConnectionSet`](super::ConnectionSet).
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    interest: Interest,
    outbound: BytesMut,
    /// The last flush stopped at `WouldBlock`; a writable event will follow.
    write_blocked: bool,
    state: ConnectionState,
    accepted_at: Instant,
    last_activity: Instant,
    bytes_read: u64,
    bytes_written: u64,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            stream,
            peer_addr,
            interest: Interest::READABLE,
            outbound: BytesMut::new(),
            write_blocked: false,
            state: ConnectionState::Accepted,
            accepted_at: now,
            last_activity: now,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }

    /// Time of the last successful read or write.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn queued_bytes(&self) -> usize {
        self.outbound.len()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, ConnectionState::Closing(_))
    }

    /// Interest this connection should be watched with right now.
    pub(crate) fn desired_interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Output is queued and nothing suggests the socket is full, so a flush
    /// can be attempted without waiting for a writable event.
    pub(crate) fn has_unblocked_output(&self) -> bool {
        !self.outbound.is_empty() && !self.write_blocked
    }

    pub(crate) fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn enqueue(&mut self, data: &[u8]) {
        self.outbound.extend_from_slice(data);
    }

    /// Move to `Closing`. The first reason wins.
    pub(crate) fn mark_closing(&mut self, reason: CloseReason) {
        if !self.is_closing() {
            trace!(id = %self.id, %reason, "Connection closing");
            self.state = ConnectionState::Closing(reason);
        }
    }

    pub(crate) fn close_reason(&self) -> Option<&CloseReason> {
        match &self.state {
            ConnectionState::Closing(reason) => Some(reason),
            _ => None,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        if self.state == ConnectionState::Accepted {
            self.state = ConnectionState::Active;
        }
    }

    /// Read into `buf` until it is full, the socket would block, or the peer
    /// closes. Returns the number of bytes placed in `buf`.
    pub(crate) fn read_into(&mut self, buf: &mut [u8]) -> (usize, ReadStatus) {
        let mut filled = 0;

        loop {
            if filled == buf.len() {
                return (filled, ReadStatus::Exhausted);
            }

            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return (filled, ReadStatus::PeerClosed),
                Ok(n) => {
                    filled += n;
                    self.bytes_read += n as u64;
                    self.touch();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return (filled, ReadStatus::Drained);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return (filled, ReadStatus::Failed(e)),
            }
        }
    }

    /// Write as much of the output queue as the socket takes. Whatever is not
    /// accepted stays at the front of the queue.
    pub(crate) fn flush(&mut self) -> (usize, FlushStatus) {
        let mut written = 0;
        self.write_blocked = false;

        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return (written, FlushStatus::Failed(ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    self.outbound.advance(n);
                    written += n;
                    self.bytes_written += n as u64;
                    self.touch();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.write_blocked = true;
                    return (written, FlushStatus::Partial);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return (written, FlushStatus::Failed(e)),
            }
        }

        (written, FlushStatus::Complete)
    }
}
