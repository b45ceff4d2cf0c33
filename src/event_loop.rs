//! Event Loop
//!
//! [`EventLoop`] is the one context object of a server instance: it owns the
//! listener, the connection set, the watch list and the protocol handler. Each
//! call to [`EventLoop::run_once`] is one readiness cycle:
//!
//! 1. sync each connection's interest (read, plus write while output is queued)
//! 2. wait for readiness, or the timeout
//! 3. accept from the listener, bounded per cycle
//! 4. read from / flush to every ready connection
//! 5. tick the handler, then close everything marked `Closing`
//!
//! Nothing here blocks except the wait in step 2.

use std::collections::HashSet;
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use mio::net::TcpStream;
use mio::Interest;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{Config, EventLoopConfig};
use crate::connection::handle::{FlushStatus, ReadStatus};
use crate::connection::{CloseReason, ConnectionHandle, ConnectionId, ConnectionSet, ConnectionState, Control};
use crate::error::LoopError;
use crate::handler::ConnectionHandler;
use crate::listener::{is_transient_accept_error, Accept, Listener};
use crate::poller::{MioWatchList, Notify, Readiness, WatchList, LISTENER_TOKEN};

/// Ids below this are reserved for the listener and waker tokens.
const FIRST_CONNECTION_ID: usize = 2;

/// Tunables for one event loop.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Upper bound on a single readiness wait. `None` blocks until something
    /// is ready.
    pub poll_timeout: Option<Duration>,
    /// Accepts per cycle. `None` accepts until the listener would block.
    pub max_accepts_per_cycle: Option<usize>,
    /// Bytes read from one connection per cycle.
    pub read_buffer_size: usize,
    pub events_capacity: usize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Some(Duration::from_secs(1)),
            max_accepts_per_cycle: None,
            read_buffer_size: 64 * 1024,
            events_capacity: 1024,
        }
    }
}

impl From<&EventLoopConfig> for LoopOptions {
    fn from(config: &EventLoopConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout,
            max_accepts_per_cycle: config.max_accepts_per_cycle,
            read_buffer_size: config.read_buffer_size,
            events_capacity: config.events_capacity,
        }
    }
}

/// What happened during one cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Sources reported ready (listener included).
    pub ready: usize,
    pub accepted: usize,
    pub closed: usize,
    pub bytes_read: usize,
    pub bytes_written: usize,
    /// The wait returned without any ready source.
    pub timed_out: bool,
}

impl CycleReport {
    /// True when the cycle changed nothing.
    pub fn is_idle(&self) -> bool {
        self.accepted == 0 && self.closed == 0 && self.bytes_read == 0 && self.bytes_written == 0
    }
}

/// Running totals for an event loop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoopStats {
    pub cycles: u64,
    pub active_connections: usize,
    pub total_accepted: u64,
    pub total_closed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Snapshot of one connection for diagnostics.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub state: ConnectionState,
    pub start_time: Instant,
    pub last_activity: Instant,
    pub queued_bytes: usize,
}

impl From<&ConnectionHandle> for ConnectionInfo {
    fn from(handle: &ConnectionHandle) -> Self {
        Self {
            id: handle.id(),
            addr: handle.peer_addr(),
            state: handle.state().clone(),
            start_time: handle.accepted_at(),
            last_activity: handle.last_activity(),
            queued_bytes: handle.queued_bytes(),
        }
    }
}

/// Thread-safe handle for stopping a running loop.
#[derive(Clone)]
pub struct LoopHandle {
    stop: Arc<AtomicBool>,
    notifier: Arc<dyn Notify>,
}

impl LoopHandle {
    /// Ask the loop to stop. The current cycle completes, then every open
    /// connection is closed and [`EventLoop::run`] returns.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            info!("Event loop stop requested");
        }
        if let Err(e) = self.notifier.notify() {
            warn!("Failed to wake event loop: {}", e);
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

/// Single-threaded multiplexed connection manager.
pub struct EventLoop<H, W = MioWatchList> {
    listener: Listener,
    connections: ConnectionSet,
    watch: W,
    handler: H,
    options: LoopOptions,
    read_buf: Vec<u8>,
    ready: Vec<Readiness>,
    /// Connections whose last read stopped at the budget, not at `WouldBlock`.
    pending_reads: HashSet<ConnectionId>,
    /// Connections with queued output whose socket has not reported `WouldBlock`.
    pending_writes: Vec<ConnectionId>,
    /// The accept loop stopped at its cap with connections possibly pending.
    listener_backlogged: bool,
    /// The accept loop stopped on an error; retry after a normal wait.
    accept_retry: bool,
    next_id: usize,
    stop: Arc<AtomicBool>,
    notifier: Arc<dyn Notify>,
    stats: LoopStats,
}

impl<H: ConnectionHandler> EventLoop<H, MioWatchList> {
    /// Build a loop around an already listening socket.
    pub fn new(listener: Listener, handler: H, options: LoopOptions) -> Result<Self, LoopError> {
        let watch = MioWatchList::new(options.events_capacity).map_err(LoopError::Backend)?;
        Self::with_watch_list(listener, handler, options, watch)
    }

    /// Start the listener described by `config` and build a loop around it.
    pub fn from_config(config: &Config, handler: H) -> crate::Result<Self> {
        let listener = Listener::start(config.server.port, config.server.backlog)
            .with_context(|| format!("Failed to start listener on port {}", config.server.port))?;

        let options = LoopOptions::from(&config.event_loop);
        let event_loop = Self::new(listener, handler, options)
            .context("Failed to initialise event loop")?;

        Ok(event_loop)
    }
}

impl<H: ConnectionHandler, W: WatchList> EventLoop<H, W> {
    /// Build a loop on a custom readiness backend.
    pub fn with_watch_list(
        mut listener: Listener,
        handler: H,
        options: LoopOptions,
        mut watch: W,
    ) -> Result<Self, LoopError> {
        if let Some(source) = listener.source_mut() {
            watch
                .register(source, LISTENER_TOKEN, Interest::READABLE)
                .map_err(LoopError::ListenerRegistration)?;
        }
        let notifier = watch.notifier().map_err(LoopError::Notifier)?;

        Ok(Self {
            listener,
            connections: ConnectionSet::new(),
            watch,
            handler,
            read_buf: vec![0; options.read_buffer_size.max(1)],
            options,
            ready: Vec::new(),
            pending_reads: HashSet::new(),
            pending_writes: Vec::new(),
            listener_backlogged: false,
            accept_retry: false,
            next_id: FIRST_CONNECTION_ID,
            stop: Arc::new(AtomicBool::new(false)),
            notifier,
            stats: LoopStats::default(),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            stop: Arc::clone(&self.stop),
            notifier: Arc::clone(&self.notifier),
        }
    }

    /// Run cycles until stopped through a [`LoopHandle`].
    ///
    /// The stop flag is checked once per cycle, before the wait. On return all
    /// connections have been closed, whether the loop stopped or failed.
    pub fn run(&mut self) -> Result<(), LoopError> {
        info!(
            "Event loop running on {} (poll timeout {:?}, accept cap {:?})",
            self.listener.local_addr(),
            self.options.poll_timeout,
            self.options.max_accepts_per_cycle
        );

        while !self.stop.load(Ordering::Acquire) {
            self.run_once(self.options.poll_timeout)?;
        }

        info!(
            "Event loop stopping, closing {} open connections",
            self.connections.len()
        );
        self.close_all(CloseReason::Shutdown);
        info!("Event loop stopped after {} cycles", self.stats.cycles);
        Ok(())
    }

    /// Run exactly one readiness cycle.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<CycleReport, LoopError> {
        let mut report = CycleReport::default();
        self.stats.cycles += 1;

        self.sync_interest();

        let carried_over = self.listener_backlogged
            || !self.pending_reads.is_empty()
            || !self.pending_writes.is_empty();
        let timeout = if carried_over {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        if let Err(e) = self.watch.wait(&mut self.ready, timeout) {
            if e.kind() == ErrorKind::Interrupted {
                self.ready.clear();
            } else {
                error!("Readiness wait failed, closing all connections: {}", e);
                self.close_all(CloseReason::Shutdown);
                return Err(LoopError::ReadinessWait(e));
            }
        }

        let retry_accept = std::mem::take(&mut self.accept_retry);
        if std::mem::take(&mut self.listener_backlogged) || retry_accept {
            push_ready(&mut self.ready, Readiness::pending_read(LISTENER_TOKEN));
        }
        for id in self.pending_reads.drain() {
            push_ready(&mut self.ready, Readiness::pending_read(id.token()));
        }
        for id in self.pending_writes.drain(..) {
            push_ready(&mut self.ready, Readiness::pending_write(id.token()));
        }

        report.ready = self.ready.len();
        report.timed_out = self.ready.is_empty();
        trace!("Cycle {}: {} sources ready", self.stats.cycles, report.ready);

        let ready = std::mem::take(&mut self.ready);

        if ready.iter().any(|r| r.token == LISTENER_TOKEN) {
            report.accepted = self.accept_connections();
        }

        for readiness in ready.iter().filter(|r| r.token != LISTENER_TOKEN) {
            self.dispatch(ConnectionId::from(readiness.token), readiness, &mut report);
        }

        self.ready = ready;

        self.handler
            .on_tick(&mut Control::new(&mut self.connections), Instant::now());

        report.closed = self.close_pending();

        self.stats.bytes_read += report.bytes_read as u64;
        self.stats.bytes_written += report.bytes_written as u64;

        Ok(report)
    }

    /// Stop accepting. Connections already accepted keep being served.
    pub fn close_listener(&mut self) {
        if let Some(source) = self.listener.source_mut() {
            if let Err(e) = self.watch.unregister(source) {
                debug!("Failed to unwatch listener: {}", e);
            }
        }
        self.listener.close();
        self.listener_backlogged = false;
        self.accept_retry = false;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_open()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.ids()
    }

    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(id).map(ConnectionInfo::from)
    }

    pub fn active_connection_info(&self) -> Vec<ConnectionInfo> {
        self.connections.iter().map(ConnectionInfo::from).collect()
    }

    pub fn stats(&self) -> LoopStats {
        LoopStats {
            active_connections: self.connections.len(),
            ..self.stats.clone()
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Run `f` with handler access outside of a callback, e.g. to queue data
    /// from the owning code between cycles.
    pub fn with_control<R>(&mut self, f: impl FnOnce(&mut H, &mut Control<'_>) -> R) -> R {
        let mut control = Control::new(&mut self.connections);
        f(&mut self.handler, &mut control)
    }

    pub fn into_handler(mut self) -> H {
        self.close_all(CloseReason::Shutdown);
        self.handler
    }

    /// Also collects connections whose output can be flushed without waiting
    /// for a writable edge, e.g. bytes queued after a flush emptied the queue.
    fn sync_interest(&mut self) {
        self.pending_writes.clear();

        for connection in self.connections.iter_mut() {
            if connection.is_closing() {
                continue;
            }

            if connection.has_unblocked_output() {
                self.pending_writes.push(connection.id());
            }

            let desired = connection.desired_interest();
            if desired == connection.interest() {
                continue;
            }

            let token = connection.id().token();
            match self.watch.reregister(connection.stream_mut(), token, desired) {
                Ok(()) => connection.set_interest(desired),
                Err(e) => {
                    warn!("Failed to update interest for {}: {}", connection.id(), e);
                    connection.mark_closing(CloseReason::Registration(e.kind()));
                }
            }
        }
    }

    fn accept_connections(&mut self) -> usize {
        let cap = self.options.max_accepts_per_cycle.unwrap_or(usize::MAX);
        let mut accepted = 0;

        while accepted < cap {
            match self.listener.accept() {
                Ok(Accept::Connection(stream, peer_addr)) => {
                    if self.register_connection(stream, peer_addr) {
                        accepted += 1;
                    }
                }
                Ok(Accept::WouldBlock) => return accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    warn!("Transient accept error: {}", e);
                }
                Err(e) => {
                    error!(
                        "Error accepting connection on {}, retrying next cycle: {}",
                        self.listener.local_addr(),
                        e
                    );
                    self.accept_retry = true;
                    return accepted;
                }
            }
        }

        debug!("Accept cap of {} reached, resuming next cycle", cap);
        self.listener_backlogged = true;
        accepted
    }

    fn register_connection(&mut self, mut stream: TcpStream, peer_addr: SocketAddr) -> bool {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        if let Err(e) = self.watch.register(&mut stream, id.token(), Interest::READABLE) {
            warn!("Failed to watch connection from {}, dropping it: {}", peer_addr, e);
            return false;
        }

        self.connections
            .insert(ConnectionHandle::new(id, stream, peer_addr));
        self.stats.total_accepted += 1;
        info!("Accepted connection {} from {}", id, peer_addr);

        self.handler
            .on_accepted(&mut Control::new(&mut self.connections), id, peer_addr);
        true
    }

    #[instrument(level = "trace", skip(self, readiness, report))]
    fn dispatch(&mut self, id: ConnectionId, readiness: &Readiness, report: &mut CycleReport) {
        if readiness.readable || readiness.hangup {
            self.read_ready(id, report);
        }
        if readiness.writable {
            self.write_ready(id, report);
        }
    }

    fn read_ready(&mut self, id: ConnectionId, report: &mut CycleReport) {
        let (len, status) = match self.connections.get_mut(id) {
            Some(connection) if !connection.is_closing() => connection.read_into(&mut self.read_buf),
            Some(_) => return,
            None => {
                trace!("Readiness for unknown connection {}", id);
                return;
            }
        };

        report.bytes_read += len;
        if len > 0 {
            trace!("Read {} bytes from {}", len, id);
            self.handler.on_readable(
                &mut Control::new(&mut self.connections),
                id,
                &self.read_buf[..len],
            );
        }

        let close = match status {
            ReadStatus::Drained => None,
            ReadStatus::Exhausted => {
                self.pending_reads.insert(id);
                None
            }
            ReadStatus::PeerClosed => {
                debug!("Connection {} closed by peer", id);
                Some(CloseReason::PeerClosed)
            }
            ReadStatus::Failed(e) => {
                warn!("Read error on {}: {}", id, e);
                Some(CloseReason::ReadError(e.kind()))
            }
        };

        if let (Some(reason), Some(connection)) = (close, self.connections.get_mut(id)) {
            connection.mark_closing(reason);
        }
    }

    fn write_ready(&mut self, id: ConnectionId, report: &mut CycleReport) {
        let Some(connection) = self.connections.get_mut(id) else {
            return;
        };
        if connection.is_closing() || connection.queued_bytes() == 0 {
            return;
        }

        let (written, status) = connection.flush();
        report.bytes_written += written;
        trace!("Wrote {} bytes to {}", written, id);

        match status {
            FlushStatus::Complete => {
                self.handler
                    .on_writable(&mut Control::new(&mut self.connections), id);
            }
            FlushStatus::Partial => {
                trace!(
                    "Partial write to {}, {} bytes still queued",
                    id,
                    connection.queued_bytes()
                );
            }
            FlushStatus::Failed(e) => {
                warn!("Write error on {}: {}", id, e);
                connection.mark_closing(CloseReason::WriteError(e.kind()));
            }
        }
    }

    /// Remove and close every connection in the `Closing` state.
    fn close_pending(&mut self) -> usize {
        let closing = self.connections.closing_ids();

        for &id in &closing {
            let Some(mut connection) = self.connections.remove(id) else {
                continue;
            };
            let reason = connection
                .close_reason()
                .cloned()
                .unwrap_or(CloseReason::Requested);

            if !reason.is_error() && connection.queued_bytes() > 0 {
                let (written, _) = connection.flush();
                self.stats.bytes_written += written as u64;
                if connection.queued_bytes() > 0 {
                    debug!(
                        "Discarding {} unsent bytes for {}",
                        connection.queued_bytes(),
                        id
                    );
                }
            }

            if let Err(e) = self.watch.unregister(connection.stream_mut()) {
                debug!("Failed to unwatch {}: {}", id, e);
            }
            self.pending_reads.remove(&id);

            info!(
                "Connection {} from {} closed after {:?} ({})",
                id,
                connection.peer_addr(),
                connection.accepted_at().elapsed(),
                reason
            );
            drop(connection);

            self.stats.total_closed += 1;
            self.handler.on_closed(id, &reason);
        }

        closing.len()
    }

    fn close_all(&mut self, reason: CloseReason) {
        self.connections.mark_all_closing(reason);
        self.close_pending();
    }
}

fn push_ready(ready: &mut Vec<Readiness>, readiness: Readiness) {
    match ready.iter_mut().find(|r| r.token == readiness.token) {
        Some(existing) => existing.merge(&readiness),
        None => ready.push(readiness),
    }
}
