//! Idle Connection Reaper
//!
//! The core never times connections out on its own. [`IdleReaper`] layers that
//! policy on top of any handler: on each tick it closes connections whose last
//! read or write is older than the configured timeout.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::connection::{CloseReason, ConnectionId, Control};
use crate::handler::ConnectionHandler;

/// Handler decorator that closes idle connections.
#[derive(Debug)]
pub struct IdleReaper<H> {
    inner: H,
    idle_timeout: Duration,
    scan_interval: Duration,
    last_scan: Option<Instant>,
    reaped: u64,
}

impl<H> IdleReaper<H> {
    pub fn new(inner: H, idle_timeout: Duration) -> Self {
        Self {
            inner,
            idle_timeout,
            scan_interval: idle_timeout.min(Duration::from_secs(1)),
            last_scan: None,
            reaped: 0,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Connections closed for idleness so far.
    pub fn reaped(&self) -> u64 {
        self.reaped
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut H {
        &mut self.inner
    }

    pub fn into_inner(self) -> H {
        self.inner
    }

    fn reap(&mut self, ctl: &mut Control<'_>, now: Instant) {
        let mut reaped = 0;
        for id in ctl.ids() {
            let Some(last_activity) = ctl.last_activity(id) else {
                continue;
            };
            let idle = now.saturating_duration_since(last_activity);
            if idle >= self.idle_timeout && ctl.close_with(id, CloseReason::IdleTimeout) {
                debug!("Connection {} idle for {:?}, closing", id, idle);
                reaped += 1;
            }
        }

        if reaped > 0 {
            info!(
                "Closing {} connections idle longer than {:?}",
                reaped, self.idle_timeout
            );
            self.reaped += reaped;
        }
    }
}

impl<H: ConnectionHandler> ConnectionHandler for IdleReaper<H> {
    fn on_accepted(&mut self, ctl: &mut Control<'_>, id: ConnectionId, peer: SocketAddr) {
        self.inner.on_accepted(ctl, id, peer);
    }

    fn on_readable(&mut self, ctl: &mut Control<'_>, id: ConnectionId, data: &[u8]) {
        self.inner.on_readable(ctl, id, data);
    }

    fn on_writable(&mut self, ctl: &mut Control<'_>, id: ConnectionId) {
        self.inner.on_writable(ctl, id);
    }

    fn on_closed(&mut self, id: ConnectionId, reason: &CloseReason) {
        self.inner.on_closed(id, reason);
    }

    fn on_tick(&mut self, ctl: &mut Control<'_>, now: Instant) {
        self.inner.on_tick(ctl, now);

        let due = self
            .last_scan
            .map_or(true, |last| now.saturating_duration_since(last) >= self.scan_interval);
        if due {
            self.last_scan = Some(now);
            self.reap(ctl, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{EventLoop, LoopOptions};
    use crate::handler::EchoHandler;
    use crate::listener::Listener;
    use std::io::{Read, Write};

    #[test]
    fn test_scan_interval_never_exceeds_timeout() {
        let reaper = IdleReaper::new(EchoHandler::new(), Duration::from_millis(200));
        assert_eq!(reaper.scan_interval, Duration::from_millis(200));

        let reaper = IdleReaper::new(EchoHandler::new(), Duration::from_secs(300));
        assert_eq!(reaper.scan_interval, Duration::from_secs(1));
    }

    struct Sink;

    impl ConnectionHandler for Sink {
        fn on_readable(&mut self, _ctl: &mut Control<'_>, _id: ConnectionId, _data: &[u8]) {}
    }

    #[test]
    fn test_idle_connection_is_reaped_active_one_kept() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let handler = IdleReaper::new(Sink, Duration::from_millis(150));
        let mut event_loop = EventLoop::new(listener, handler, LoopOptions::default()).unwrap();
        let addr = event_loop.local_addr();

        let mut idle = std::net::TcpStream::connect(addr).unwrap();
        let mut busy = std::net::TcpStream::connect(addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while event_loop.handler().reaped() == 0 {
            assert!(Instant::now() < deadline, "idle connection never reaped");
            busy.write_all(b"x").unwrap();
            event_loop
                .run_once(Some(Duration::from_millis(20)))
                .unwrap();
        }

        assert_eq!(event_loop.handler().reaped(), 1);
        assert_eq!(event_loop.connection_count(), 1);

        idle.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut rest = Vec::new();
        idle.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}
