//! End-to-end tests over loopback sockets.

use crate::{
    Backend, ConnId, DatagramNode, EngineConfig, NetError, StreamCallbacks, StreamClient,
    StreamHandle, StreamHandler, StreamServer,
};

use cqnet_core::IO_BUFFER_SIZE;
use cqnet_module::{UringQueue, UringQueueConfig};

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(5);

/// io_uring is often blocked in containers; those runs are skipped.
fn uring_available() -> bool {
    match UringQueue::new(UringQueueConfig { entries: 8 }) {
        Ok(_) => true,
        Err(e) => {
            eprintln!("skipping io_uring run: {}", e);
            false
        }
    }
}

/// One `#[test]` per backend for a scenario taking a `Backend`.
macro_rules! on_both_backends {
    ($scenario:ident => $epoll:ident, $uring:ident) => {
        #[test]
        fn $epoll() {
            $scenario(Backend::Epoll);
        }

        #[test]
        fn $uring() {
            if uring_available() {
                $scenario(Backend::Uring);
            }
        }
    };
}

fn config(backend: Backend) -> EngineConfig {
    EngineConfig::new()
        .num_workers(2)
        .wait_timeout(Duration::from_millis(50))
        .join_timeout(Duration::from_secs(2))
        .drain_grace(Duration::from_millis(200))
        .backend(backend)
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Connected(ConnId),
    Received(ConnId, Vec<u8>),
    Disconnected(ConnId),
    ReceivedFrom(ConnId, Vec<u8>, SocketAddrV4),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    cond: Condvar,
}

impl Recorder {
    fn push(&self, e: Event) {
        self.events.lock().unwrap().push(e);
        self.cond.notify_all();
    }

    /// Block until `done` holds over the recorded events (or the deadline).
    fn wait_until<F: Fn(&[Event]) -> bool>(&self, done: F) -> bool {
        let deadline = Instant::now() + DEADLINE;
        let mut events = self.events.lock().unwrap();
        while !done(&events) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self.cond.wait_timeout(events, deadline - now).unwrap().0;
        }
        true
    }

    fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn connected(&self) -> Option<ConnId> {
        self.snapshot().into_iter().find_map(|e| match e {
            Event::Connected(id) => Some(id),
            _ => None,
        })
    }

    fn bytes_for(events: &[Event], id: ConnId) -> Vec<u8> {
        let mut out = Vec::new();
        for e in events {
            if let Event::Received(from, data) = e {
                if *from == id {
                    out.extend_from_slice(data);
                }
            }
        }
        out
    }

    fn disconnects(events: &[Event], id: ConnId) -> usize {
        events.iter().filter(|e| **e == Event::Disconnected(id)).count()
    }
}

impl StreamHandler for Recorder {
    fn on_connected(&self, id: ConnId) {
        self.push(Event::Connected(id));
    }
    fn on_received(&self, id: ConnId, data: &[u8]) {
        self.push(Event::Received(id, data.to_vec()));
    }
    fn on_disconnected(&self, id: ConnId) {
        self.push(Event::Disconnected(id));
    }
}

fn server(backend: Backend) -> (StreamServer, Arc<Recorder>) {
    let rec = Arc::new(Recorder::default());
    let mut server = StreamServer::init(config(backend), rec.clone(), "127.0.0.1", 0).unwrap();
    server.start().unwrap();
    (server, rec)
}

fn client(backend: Backend) -> (StreamClient, Arc<Recorder>) {
    let rec = Arc::new(Recorder::default());
    let mut client = StreamClient::init(config(backend), rec.clone()).unwrap();
    client.start().unwrap();
    (client, rec)
}

/// Connect a client to `server` and return (client id, server-side id).
fn connect_pair(
    server: &StreamServer,
    srec: &Recorder,
    client: &StreamClient,
) -> (ConnId, ConnId) {
    let cid = client.connect("127.0.0.1", server.local_addr().port()).unwrap();
    assert!(srec.wait_until(|ev| ev.iter().any(|e| matches!(e, Event::Connected(_)))));
    (cid, srec.connected().unwrap())
}

fn ping_disconnect(backend: Backend) {
    let (server, srec) = server(backend);
    let (client, crec) = client(backend);
    assert_ne!(server.local_addr().port(), 0);

    let (cid, sid) = connect_pair(&server, &srec, &client);
    client.send(cid, b"PING").unwrap();
    assert!(srec.wait_until(|ev| Recorder::bytes_for(ev, sid) == b"PING"));

    // Connected precedes the first Received for the same id.
    let events = srec.snapshot();
    let first_conn = events.iter().position(|e| *e == Event::Connected(sid)).unwrap();
    let first_recv = events
        .iter()
        .position(|e| matches!(e, Event::Received(id, _) if *id == sid))
        .unwrap();
    assert!(first_conn < first_recv);

    server.send(sid, b"PONG").unwrap();
    assert!(crec.wait_until(|ev| Recorder::bytes_for(ev, cid) == b"PONG"));

    client.close_socket(cid);
    assert!(srec.wait_until(|ev| Recorder::disconnects(ev, sid) == 1));

    // Application close is not reported back to the closing side.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(Recorder::disconnects(&crec.snapshot(), cid), 0);
    assert!(crec.connected().is_none(), "clients never see on_connected");

    client.deinit();
    server.deinit();
}

on_both_backends!(ping_disconnect =>
    test_ping_and_disconnect_epoll,
    test_ping_and_disconnect_uring);

#[test]
fn test_ping_and_disconnect_auto_backend() {
    ping_disconnect(Backend::Auto);
}

fn recording_node(backend: Backend) -> (DatagramNode, Arc<Recorder>) {
    let rec = Arc::new(Recorder::default());
    let sink = rec.clone();
    let on_datagram = move |id: ConnId, data: &[u8], from: SocketAddrV4| {
        sink.push(Event::ReceivedFrom(id, data.to_vec(), from));
    };
    let mut node = DatagramNode::init(config(backend), on_datagram).unwrap();
    node.start().unwrap();
    (node, rec)
}

fn datagram_port_zero(backend: Backend) {
    let (node, rec) = recording_node(backend);

    let (a, port_a) = node.create("127.0.0.1", 0).unwrap();
    let (b, port_b) = node.create("*", 0).unwrap();
    assert_ne!(port_a, 0);
    assert_ne!(port_b, 0);
    assert_eq!(node.local_addr(a).unwrap().port(), port_a);

    let to_b = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port_b);
    node.send_to(a, b"hello", to_b).unwrap();

    let from_a = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port_a);
    let expected = Event::ReceivedFrom(b, b"hello".to_vec(), from_a);
    assert!(rec.wait_until(|ev| ev.contains(&expected)));

    // Receives keep flowing after the first one.
    node.handle().send_to(a, b"again", to_b).unwrap();
    assert!(rec.wait_until(|ev| {
        ev.iter().any(|e| matches!(e, Event::ReceivedFrom(_, d, _) if d == b"again"))
    }));

    let too_big = vec![0u8; IO_BUFFER_SIZE + 1];
    assert!(matches!(
        node.send_to(a, &too_big, to_b),
        Err(NetError::PayloadTooLarge { .. })
    ));
    node.deinit();
}

on_both_backends!(datagram_port_zero =>
    test_datagram_port_zero_and_source_address_epoll,
    test_datagram_port_zero_and_source_address_uring);

fn oversized_datagram(backend: Backend) {
    let (node, rec) = recording_node(backend);
    let (id, port) = node.create("127.0.0.1", 0).unwrap();
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();

    peer.send_to(&vec![9u8; IO_BUFFER_SIZE + 904], ("127.0.0.1", port)).unwrap();
    assert!(rec.wait_until(|ev| !ev.is_empty()));
    match &rec.snapshot()[0] {
        Event::ReceivedFrom(got, data, _) => {
            assert_eq!(*got, id);
            assert_eq!(data.len(), IO_BUFFER_SIZE, "cut to the buffer size");
        }
        other => panic!("unexpected {:?}", other),
    }

    // The socket is still receiving.
    peer.send_to(b"small", ("127.0.0.1", port)).unwrap();
    assert!(rec.wait_until(|ev| {
        ev.iter().any(|e| matches!(e, Event::ReceivedFrom(_, d, _) if d == b"small"))
    }));
    node.deinit();
}

on_both_backends!(oversized_datagram =>
    test_oversized_datagram_truncated_epoll,
    test_oversized_datagram_truncated_uring);

fn back_to_back_order(backend: Backend) {
    let (server, srec) = server(backend);
    let (client, _crec) = client(backend);
    let (cid, sid) = connect_pair(&server, &srec, &client);

    let mut expected = Vec::new();
    for burst in [10usize, 1000, 1] {
        for i in 0..burst {
            let msg = format!("<{}:{}>", burst, i);
            client.send(cid, msg.as_bytes()).unwrap();
            expected.extend_from_slice(msg.as_bytes());
        }
    }
    assert!(srec.wait_until(|ev| Recorder::bytes_for(ev, sid).len() >= expected.len()));
    assert_eq!(Recorder::bytes_for(&srec.snapshot(), sid), expected);
}

on_both_backends!(back_to_back_order =>
    test_back_to_back_sends_arrive_in_order_epoll,
    test_back_to_back_sends_arrive_in_order_uring);

fn large_payload_split(backend: Backend) {
    let (server, srec) = server(backend);
    let (client, _crec) = client(backend);
    let (cid, sid) = connect_pair(&server, &srec, &client);

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    client.send(cid, &payload).unwrap();
    assert!(srec.wait_until(|ev| Recorder::bytes_for(ev, sid).len() >= payload.len()));
    assert_eq!(Recorder::bytes_for(&srec.snapshot(), sid), payload);
}

on_both_backends!(large_payload_split =>
    test_payload_larger_than_buffer_is_split_in_order_epoll,
    test_payload_larger_than_buffer_is_split_in_order_uring);

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

/// A peer that stops reading must not stall `send` or get disconnected;
/// the queued bytes go out once it reads again.
fn slow_reader(backend: Backend) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (client, crec) = client(backend);
    let cid = client.connect("127.0.0.1", port).unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    const CHUNK: usize = 64 * 1024;
    const CHUNKS: usize = 200;
    let expected = pattern(CHUNK * CHUNKS);
    let mut worst = Duration::ZERO;
    for chunk in expected.chunks(CHUNK) {
        let started = Instant::now();
        client.send(cid, chunk).unwrap();
        worst = worst.max(started.elapsed());
    }
    assert!(worst < Duration::from_millis(500), "send blocked for {:?}", worst);

    // Stay stalled well past any write timeout before reading.
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(Recorder::disconnects(&crec.snapshot(), cid), 0);

    peer.set_read_timeout(Some(DEADLINE)).unwrap();
    let mut got = vec![0u8; expected.len()];
    peer.read_exact(&mut got).unwrap();
    assert!(got == expected, "bytes arrived out of order");
    assert_eq!(Recorder::disconnects(&crec.snapshot(), cid), 0);
    client.deinit();
}

on_both_backends!(slow_reader =>
    test_slow_reader_neither_blocks_nor_disconnects_epoll,
    test_slow_reader_neither_blocks_nor_disconnects_uring);

fn peer_close_once(backend: Backend) {
    let (server, srec) = server(backend);
    let mut peer = TcpStream::connect(("127.0.0.1", server.local_addr().port())).unwrap();
    peer.write_all(b"hi").unwrap();
    assert!(srec.wait_until(|ev| ev.iter().any(|e| matches!(e, Event::Received(..)))));
    let sid = srec.connected().unwrap();

    drop(peer);
    assert!(srec.wait_until(|ev| Recorder::disconnects(ev, sid) >= 1));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(Recorder::disconnects(&srec.snapshot(), sid), 1);

    assert!(matches!(server.send(sid, b"late"), Err(NetError::NotFound(id)) if id == sid));
}

on_both_backends!(peer_close_once =>
    test_peer_close_reported_once_and_id_retired_epoll,
    test_peer_close_reported_once_and_id_retired_uring);

fn server_close_silent(backend: Backend) {
    let (server, srec) = server(backend);
    let mut peer = TcpStream::connect(("127.0.0.1", server.local_addr().port())).unwrap();
    assert!(srec.wait_until(|ev| !ev.is_empty()));
    let sid = srec.connected().unwrap();

    server.close_socket(sid);
    let mut buf = [0u8; 8];
    peer.set_read_timeout(Some(DEADLINE)).unwrap();
    assert_eq!(peer.read(&mut buf).unwrap(), 0, "peer sees EOF");

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(Recorder::disconnects(&srec.snapshot(), sid), 0);
    // Closing again, or an id that never existed, is a no-op.
    server.close_socket(sid);
    server.close_socket(ConnId::new(999, 12345));
}

on_both_backends!(server_close_silent =>
    test_server_close_socket_is_silent_epoll,
    test_server_close_socket_is_silent_uring);

fn many_clients(backend: Backend) {
    let (server, srec) = server(backend);
    let port = server.local_addr().port();
    let peers: Vec<_> = (0..8).map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap()).collect();
    let connected = |ev: &[Event]| ev.iter().filter(|e| matches!(e, Event::Connected(_))).count();
    assert!(srec.wait_until(|ev| connected(ev) == 8));
    drop(peers);
}

on_both_backends!(many_clients =>
    test_accept_keeps_running_for_many_clients_epoll,
    test_accept_keeps_running_for_many_clients_uring);

fn echo_from_callback(backend: Backend) {
    let handle: Arc<OnceLock<StreamHandle>> = Arc::new(OnceLock::new());
    let h = handle.clone();
    let echo = StreamCallbacks::new(move |id, data| {
        if let Some(h) = h.get() {
            h.send(id, data).unwrap();
        }
    });
    let mut server = StreamServer::init(config(backend), echo, "127.0.0.1", 0).unwrap();
    handle.set(server.handle()).unwrap();
    server.start().unwrap();

    let mut peer = TcpStream::connect(("127.0.0.1", server.local_addr().port())).unwrap();
    peer.set_read_timeout(Some(DEADLINE)).unwrap();
    peer.write_all(b"echo me").unwrap();
    let mut got = [0u8; 7];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"echo me");
}

on_both_backends!(echo_from_callback =>
    test_echo_through_handle_from_callback_epoll,
    test_echo_through_handle_from_callback_uring);

#[test]
fn test_unknown_id_and_not_started() {
    let rec = Arc::new(Recorder::default());
    let mut client = StreamClient::init(config(Backend::Epoll), rec).unwrap();
    assert!(matches!(client.connect("127.0.0.1", 9), Err(NetError::NotStarted)));
    assert!(matches!(client.send(ConnId::new(5, 5), b"x"), Err(NetError::NotStarted)));

    client.start().unwrap();
    client.start().unwrap();
    let ghost = ConnId::new(999, 12345);
    assert!(matches!(client.send(ghost, b"x"), Err(NetError::NotFound(id)) if id == ghost));
    client.close_socket(ghost);
}

#[test]
fn test_empty_send_is_noop() {
    let (server, srec) = server(Backend::Epoll);
    let (client, _crec) = client(Backend::Epoll);
    let (cid, sid) = connect_pair(&server, &srec, &client);
    client.send(cid, b"").unwrap();
    client.send(cid, b"x").unwrap();
    assert!(srec.wait_until(|ev| Recorder::bytes_for(ev, sid) == b"x"));
}

fn stop_idempotent(backend: Backend) {
    let (mut server, _srec) = server(backend);
    let handle = server.handle();
    assert!(server.is_running());
    assert!(handle.is_running());

    server.stop();
    server.stop();
    assert!(!server.is_running());
    assert!(!handle.is_running());
    assert!(matches!(handle.send(ConnId::new(3, 1), b"x"), Err(NetError::NotStarted)));
    assert!(matches!(server.start(), Err(NetError::Unsupported(_))));

    // The listener is gone after stop.
    assert!(TcpStream::connect(("127.0.0.1", server.local_addr().port())).is_err());
    server.deinit();
}

on_both_backends!(stop_idempotent =>
    test_stop_is_idempotent_and_final_epoll,
    test_stop_is_idempotent_and_final_uring);

/// Tearing a server down with live, receiving connections closes them all
/// and returns within the join and drain bounds.
fn deinit_with_live_connections(backend: Backend) {
    let (server, srec) = server(backend);
    let (client, crec) = client(backend);
    let port = server.local_addr().port();

    let ids: Vec<ConnId> = (0..4).map(|_| client.connect("127.0.0.1", port).unwrap()).collect();
    for id in &ids {
        client.send(*id, b"hello").unwrap();
    }
    let received = |ev: &[Event]| ev.iter().filter(|e| matches!(e, Event::Received(..))).count();
    assert!(srec.wait_until(|ev| received(ev) >= ids.len()));

    let started = Instant::now();
    server.deinit();
    assert!(started.elapsed() < Duration::from_secs(4), "deinit took {:?}", started.elapsed());

    // Every client side sees the server going away.
    assert!(crec.wait_until(|ev| ids.iter().all(|id| Recorder::disconnects(ev, *id) == 1)));
    client.deinit();
}

on_both_backends!(deinit_with_live_connections =>
    test_deinit_with_live_connections_epoll,
    test_deinit_with_live_connections_uring);

#[test]
fn test_init_rejects_bad_input() {
    let rec = Arc::new(Recorder::default());
    assert!(matches!(
        StreamServer::init(config(Backend::Epoll), rec.clone(), "not.an.ip", 0),
        Err(NetError::InvalidAddress(_))
    ));
    assert!(matches!(
        StreamServer::init(config(Backend::Epoll).num_workers(0), rec, "127.0.0.1", 0),
        Err(NetError::InvalidConfig(_))
    ));
}

#[test]
fn test_connect_refused() {
    // Grab a free port, then close it so nothing listens there.
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let (client, _crec) = client(Backend::Epoll);
    assert!(client.connect("127.0.0.1", port).is_err());
}
