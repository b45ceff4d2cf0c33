//! Integration tests for the readiness cycle, driven one cycle at a time

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use connmux::{
    CloseReason, ConnectionHandler, ConnectionId, Control, EchoHandler, EventLoop, IdleReaper,
    Listener, ListenerError, LoopOptions,
};

const CYCLE: Option<Duration> = Some(Duration::from_millis(10));

/// Answers "ping" with "pong" and remembers everything else it sees.
#[derive(Default)]
struct PingPong {
    accepted: Vec<ConnectionId>,
    received: Vec<(ConnectionId, Vec<u8>)>,
    closed: Vec<(ConnectionId, CloseReason)>,
}

impl ConnectionHandler for PingPong {
    fn on_accepted(&mut self, _ctl: &mut Control<'_>, id: ConnectionId, _peer: SocketAddr) {
        self.accepted.push(id);
    }

    fn on_readable(&mut self, ctl: &mut Control<'_>, id: ConnectionId, data: &[u8]) {
        self.received.push((id, data.to_vec()));
        if data == b"ping" {
            ctl.send(id, b"pong");
        }
    }

    fn on_closed(&mut self, id: ConnectionId, reason: &CloseReason) {
        self.closed.push((id, reason.clone()));
    }
}

fn local_loop<H: ConnectionHandler>(handler: H) -> EventLoop<H> {
    let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 128).unwrap();
    EventLoop::new(listener, handler, LoopOptions::default()).unwrap()
}

fn cycle_until<H: ConnectionHandler>(
    event_loop: &mut EventLoop<H>,
    mut done: impl FnMut(&EventLoop<H>) -> bool,
) {
    for _ in 0..1000 {
        if done(event_loop) {
            return;
        }
        event_loop.run_once(CYCLE).unwrap();
    }
    panic!("condition not reached within 1000 cycles");
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

#[test]
fn test_ping_pong_then_peer_close() {
    let mut event_loop = local_loop(PingPong::default());
    let mut client = connect(event_loop.local_addr());

    cycle_until(&mut event_loop, |l| l.connection_count() == 1);
    assert_eq!(event_loop.handler().accepted.len(), 1);
    let id = event_loop.handler().accepted[0];

    client.write_all(b"ping").unwrap();
    cycle_until(&mut event_loop, |l| l.stats().bytes_written >= 4);

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"pong");

    drop(client);
    cycle_until(&mut event_loop, |l| l.connection_count() == 0);

    assert_eq!(
        event_loop.handler().received,
        vec![(id, b"ping".to_vec())]
    );
    assert_eq!(
        event_loop.handler().closed,
        vec![(id, CloseReason::PeerClosed)]
    );
}

#[test]
fn test_silent_client_closes_exactly_once() {
    let mut event_loop = local_loop(PingPong::default());
    let client = connect(event_loop.local_addr());
    cycle_until(&mut event_loop, |l| l.connection_count() == 1);

    drop(client);
    cycle_until(&mut event_loop, |l| l.connection_count() == 0);

    for _ in 0..5 {
        event_loop.run_once(CYCLE).unwrap();
    }

    let handler = event_loop.handler();
    assert!(handler.received.is_empty());
    assert_eq!(handler.closed.len(), 1);
    assert_eq!(handler.closed[0].1, CloseReason::PeerClosed);
}

#[test]
fn test_large_echo_survives_partial_writes() {
    const LEN: usize = 8 * 1024 * 1024;
    let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();

    let mut event_loop = local_loop(EchoHandler::new());
    let client = connect(event_loop.local_addr());
    cycle_until(&mut event_loop, |l| l.connection_count() == 1);

    let mut writer = client.try_clone().unwrap();
    let outgoing = payload.clone();
    let writer = thread::spawn(move || writer.write_all(&outgoing).unwrap());

    let mut reader = client;
    let reader = thread::spawn(move || {
        let mut echoed = vec![0u8; LEN];
        reader.read_exact(&mut echoed).unwrap();
        echoed
    });

    for _ in 0..100_000 {
        if reader.is_finished() {
            break;
        }
        event_loop.run_once(CYCLE).unwrap();
    }

    writer.join().unwrap();
    let echoed = reader.join().unwrap();
    assert_eq!(echoed.len(), LEN);
    assert!(echoed == payload, "echoed bytes differ from what was sent");
    assert_eq!(event_loop.handler().echoed(), LEN as u64);
}

#[test]
fn test_closing_listener_keeps_open_connections() {
    let mut event_loop = local_loop(EchoHandler::new());
    let addr = event_loop.local_addr();
    let mut client = connect(addr);
    cycle_until(&mut event_loop, |l| l.connection_count() == 1);

    event_loop.close_listener();
    assert!(!event_loop.is_listening());
    assert!(TcpStream::connect(addr).is_err());

    client.write_all(b"still here").unwrap();
    cycle_until(&mut event_loop, |l| l.stats().bytes_written >= 10);

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"still here");
    assert_eq!(event_loop.connection_count(), 1);
}

#[test]
fn test_set_size_tracks_accepts_minus_closes() {
    let mut event_loop = local_loop(PingPong::default());
    let addr = event_loop.local_addr();

    let mut clients: Vec<TcpStream> = (0..5).map(|_| connect(addr)).collect();
    cycle_until(&mut event_loop, |l| l.connection_count() == 5);

    clients.truncate(3);
    cycle_until(&mut event_loop, |l| l.connection_count() == 3);

    let stats = event_loop.stats();
    assert_eq!(stats.total_accepted, 5);
    assert_eq!(stats.total_closed, 2);
    assert_eq!(
        stats.active_connections as u64,
        stats.total_accepted - stats.total_closed
    );

    let ids: HashSet<ConnectionId> = event_loop.connection_ids().into_iter().collect();
    assert_eq!(ids.len(), 3);
    let accepted: HashSet<ConnectionId> = event_loop.handler().accepted.iter().copied().collect();
    assert_eq!(accepted.len(), 5, "ids are never handed out twice");
}

#[test]
fn test_timeout_cycle_leaves_connections_untouched() {
    let mut event_loop = local_loop(PingPong::default());
    let _client = connect(event_loop.local_addr());
    cycle_until(&mut event_loop, |l| l.connection_count() == 1);

    let id = event_loop.connection_ids()[0];
    let before = event_loop.connection_info(id).unwrap();

    let report = event_loop.run_once(CYCLE).unwrap();

    assert!(report.timed_out);
    assert!(report.is_idle());
    let after = event_loop.connection_info(id).unwrap();
    assert_eq!(after.last_activity, before.last_activity);
    assert_eq!(after.queued_bytes, 0);
    assert_eq!(event_loop.connection_count(), 1);
}

#[test]
fn test_idle_connections_are_reaped() {
    let reaper = IdleReaper::new(PingPong::default(), Duration::from_millis(100));
    let mut event_loop = local_loop(reaper);
    let _client = connect(event_loop.local_addr());
    cycle_until(&mut event_loop, |l| l.connection_count() == 1);

    cycle_until(&mut event_loop, |l| l.connection_count() == 0);

    let reaper = event_loop.handler();
    assert_eq!(reaper.reaped(), 1);
    assert_eq!(reaper.inner().closed.len(), 1);
    assert_eq!(reaper.inner().closed[0].1, CloseReason::IdleTimeout);
}

/// Streams fixed-size chunks, queuing the next one each time the previous
/// one has been flushed.
struct Streamer {
    chunks_left: usize,
}

impl ConnectionHandler for Streamer {
    fn on_readable(&mut self, ctl: &mut Control<'_>, id: ConnectionId, _data: &[u8]) {
        if self.chunks_left > 0 {
            self.chunks_left -= 1;
            ctl.send(id, b"chunk");
        }
    }

    fn on_writable(&mut self, ctl: &mut Control<'_>, id: ConnectionId) {
        if self.chunks_left > 0 {
            self.chunks_left -= 1;
            ctl.send(id, b"chunk");
        }
    }
}

#[test]
fn test_output_queued_from_on_writable_is_flushed() {
    let mut event_loop = local_loop(Streamer { chunks_left: 5 });
    let mut client = connect(event_loop.local_addr());
    cycle_until(&mut event_loop, |l| l.connection_count() == 1);

    client.write_all(b"go").unwrap();
    cycle_until(&mut event_loop, |l| l.stats().bytes_written == 25);

    let mut received = [0u8; 25];
    client.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"chunkchunkchunkchunkchunk");
    assert_eq!(event_loop.handler().chunks_left, 0);

    let id = event_loop.connection_ids()[0];
    assert_eq!(event_loop.connection_info(id).unwrap().queued_bytes, 0);
}

#[test]
fn test_reset_peer_does_not_disturb_others() {
    let mut event_loop = local_loop(PingPong::default());
    let addr = event_loop.local_addr();

    let doomed = connect(addr);
    cycle_until(&mut event_loop, |l| l.connection_count() == 1);
    let doomed_id = event_loop.handler().accepted[0];

    let mut survivor = connect(addr);
    cycle_until(&mut event_loop, |l| l.connection_count() == 2);

    // A zero linger time turns close into a reset.
    socket2::SockRef::from(&doomed)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(doomed);
    cycle_until(&mut event_loop, |l| l.connection_count() == 1);

    let closed = &event_loop.handler().closed;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].0, doomed_id);
    assert!(
        matches!(closed[0].1, CloseReason::ReadError(_)),
        "unexpected close reason {:?}",
        closed[0].1
    );

    survivor.write_all(b"ping").unwrap();
    cycle_until(&mut event_loop, |l| l.stats().bytes_written >= 4);
    let mut reply = [0u8; 4];
    survivor.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"pong");
}

#[test]
fn test_bind_conflict_is_reported() {
    let first = Listener::bind("127.0.0.1:0".parse().unwrap(), 16).unwrap();

    match Listener::bind(first.local_addr(), 16) {
        Err(ListenerError::Bind { addr, .. }) => assert_eq!(addr, first.local_addr()),
        Err(other) => panic!("expected a bind error, got {other}"),
        Ok(_) => panic!("second listener bound to a port in use"),
    }
}
