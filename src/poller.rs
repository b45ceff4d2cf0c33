//! Readiness Watch List
//!
//! The event loop only needs four things from the OS readiness primitive:
//! register a source, change its interest, drop it, and wait. [`WatchList`]
//! captures exactly that, so the registry logic does not care whether the
//! backend is epoll, kqueue or something completion-based.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::trace;

/// Token reserved for the listening socket.
pub const LISTENER_TOKEN: Token = Token(0);
/// Token reserved for the cross-thread wake-up.
pub const WAKER_TOKEN: Token = Token(1);

/// One ready source as reported by [`WatchList::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    /// Error or hang-up reported by the OS. The next read or write surfaces it.
    pub hangup: bool,
}

impl Readiness {
    /// Readiness for a source we know still has pending input.
    pub fn pending_read(token: Token) -> Self {
        Self {
            token,
            readable: true,
            writable: false,
            hangup: false,
        }
    }

    /// Readiness for a source with output the socket has not refused yet.
    pub fn pending_write(token: Token) -> Self {
        Self {
            token,
            readable: false,
            writable: true,
            hangup: false,
        }
    }

    pub(crate) fn merge(&mut self, other: &Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.hangup |= other.hangup;
    }
}

/// Wakes a blocked [`WatchList::wait`] from another thread.
pub trait Notify: Send + Sync {
    fn notify(&self) -> io::Result<()>;
}

impl Notify for Waker {
    fn notify(&self) -> io::Result<()> {
        self.wake()
    }
}

/// Readiness primitive used by the event loop.
pub trait WatchList {
    fn register(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn reregister(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn unregister(&mut self, source: &mut dyn Source) -> io::Result<()>;

    /// Block until at least one source is ready or `timeout` elapses.
    ///
    /// `ready` is cleared first. A timeout leaves it empty and is not an error.
    /// Wake-ups through the notifier are not reported.
    fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;

    /// Handle that interrupts `wait` from any thread. Repeated calls share
    /// one underlying notifier.
    fn notifier(&mut self) -> io::Result<Arc<dyn Notify>>;
}

/// [`WatchList`] backed by `mio::Poll`.
///
/// mio is edge-triggered on most platforms: a source is reported once per
/// readiness change, so callers must drain until `WouldBlock` or remember that
/// they stopped early.
pub struct MioWatchList {
    poll: Poll,
    events: Events,
    waker: Option<Arc<Waker>>,
}

impl MioWatchList {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity.max(1)),
            waker: None,
        })
    }
}

impl WatchList for MioWatchList {
    fn register(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    fn reregister(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    fn unregister(&mut self, source: &mut dyn Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    fn wait(&mut self, ready: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        ready.clear();
        self.poll.poll(&mut self.events, timeout)?;

        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                trace!("Watch list woken by notifier");
                continue;
            }

            let readiness = Readiness {
                token,
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
                hangup: event.is_error() || event.is_read_closed() || event.is_write_closed(),
            };

            // A source can show up more than once per poll on some backends.
            match ready.iter_mut().find(|r| r.token == token) {
                Some(existing) => existing.merge(&readiness),
                None => ready.push(readiness),
            }
        }

        Ok(())
    }

    fn notifier(&mut self) -> io::Result<Arc<dyn Notify>> {
        // mio allows a single waker per poll instance.
        let waker = match &self.waker {
            Some(waker) => Arc::clone(waker),
            None => {
                let waker = Arc::new(Waker::new(self.poll.registry(), WAKER_TOKEN)?);
                self.waker = Some(Arc::clone(&waker));
                waker
            }
        };
        let notifier: Arc<dyn Notify> = waker;
        Ok(notifier)
    }
}
