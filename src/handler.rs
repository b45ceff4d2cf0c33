//! Protocol Handler Interface
//!
//! The event loop only ferries bytes. Whatever they mean is decided by a
//! [`ConnectionHandler`], which is driven through these callbacks and acts on
//! connections through [`Control`].

use std::net::SocketAddr;
use std::time::Instant;

use tracing::debug;

use crate::connection::{CloseReason, ConnectionId, Control};

/// Callbacks invoked by the event loop. Every call happens on the loop thread
/// and never concurrently for the same connection.
pub trait ConnectionHandler {
    /// A connection was accepted and is now watched.
    fn on_accepted(&mut self, _ctl: &mut Control<'_>, _id: ConnectionId, _peer: SocketAddr) {}

    /// Bytes arrived on `id`. `data` is only valid for the duration of the call.
    fn on_readable(&mut self, ctl: &mut Control<'_>, id: ConnectionId, data: &[u8]);

    /// The output queue of `id` was fully flushed.
    fn on_writable(&mut self, _ctl: &mut Control<'_>, _id: ConnectionId) {}

    /// `id` has been removed from the set and its socket closed.
    fn on_closed(&mut self, _id: ConnectionId, _reason: &CloseReason) {}

    /// Called once at the end of every cycle, including cycles that timed out.
    fn on_tick(&mut self, _ctl: &mut Control<'_>, _now: Instant) {}
}

impl<H: ConnectionHandler + ?Sized> ConnectionHandler for Box<H> {
    fn on_accepted(&mut self, ctl: &mut Control<'_>, id: ConnectionId, peer: SocketAddr) {
        (**self).on_accepted(ctl, id, peer)
    }

    fn on_readable(&mut self, ctl: &mut Control<'_>, id: ConnectionId, data: &[u8]) {
        (**self).on_readable(ctl, id, data)
    }

    fn on_writable(&mut self, ctl: &mut Control<'_>, id: ConnectionId) {
        (**self).on_writable(ctl, id)
    }

    fn on_closed(&mut self, id: ConnectionId, reason: &CloseReason) {
        (**self).on_closed(id, reason)
    }

    fn on_tick(&mut self, ctl: &mut Control<'_>, now: Instant) {
        (**self).on_tick(ctl, now)
    }
}

/// Sends every byte back to where it came from.
#[derive(Debug, Default)]
pub struct EchoHandler {
    echoed: u64,
}

impl EchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes queued for echo so far.
    pub fn echoed(&self) -> u64 {
        self.echoed
    }
}

impl ConnectionHandler for EchoHandler {
    fn on_readable(&mut self, ctl: &mut Control<'_>, id: ConnectionId, data: &[u8]) {
        if ctl.send(id, data) {
            self.echoed += data.len() as u64;
        }
    }

    fn on_closed(&mut self, id: ConnectionId, reason: &CloseReason) {
        debug!("Echo connection {} finished: {}", id, reason);
    }
}
