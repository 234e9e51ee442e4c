use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use microbridge::{
    AdbListener, BridgeConfig, BridgeError, ConnectionState, DispatchMode, MicroBridge,
};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Started,
    Stopped,
    Connected,
    Disconnected,
    Data(Vec<u8>),
}

struct ChannelListener(Sender<(Seen, thread::ThreadId)>);

impl ChannelListener {
    fn push(&self, seen: Seen) {
        let _ = self.0.send((seen, thread::current().id()));
    }
}

impl AdbListener for ChannelListener {
    fn adb_connected(&mut self) {
        self.push(Seen::Connected);
    }

    fn adb_disconnected(&mut self) {
        self.push(Seen::Disconnected);
    }

    fn adb_event(&mut self, data: &[u8]) {
        self.push(Seen::Data(data.to_vec()));
    }

    fn server_started(&mut self, _local_addr: SocketAddr) {
        self.push(Seen::Started);
    }

    fn server_stopped(&mut self) {
        self.push(Seen::Stopped);
    }
}

struct Harness {
    bridge: MicroBridge,
    rx: Receiver<(Seen, thread::ThreadId)>,
}

impl Harness {
    fn new(dispatch: DispatchMode) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (tx, rx) = unbounded();
        let config = BridgeConfig {
            dispatch,
            ..BridgeConfig::loopback()
        };
        let bridge = MicroBridge::with_config(ChannelListener(tx), config).unwrap();
        Self { bridge, rx }
    }

    /// Start on an ephemeral port and consume the `Started` callback.
    fn connected() -> (Self, SocketAddr) {
        let harness = Self::new(DispatchMode::Thread);
        harness.bridge.connect_on(0);
        let addr = harness.bridge.local_addr().expect("relay server listening");
        assert_eq!(harness.next(), Seen::Started);
        (harness, addr)
    }

    fn next(&self) -> Seen {
        self.rx.recv_timeout(WAIT).expect("listener callback").0
    }

    fn assert_quiet(&self) {
        if let Ok((seen, _)) = self.rx.recv_timeout(QUIET) {
            panic!("unexpected callback: {seen:?}");
        }
    }
}

fn peer(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nodelay(true).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

#[test]
fn connect_data_disconnect_are_ordered() {
    let (h, addr) = Harness::connected();

    let mut p = peer(addr);
    assert_eq!(h.next(), Seen::Connected);
    assert_eq!(h.bridge.state(), ConnectionState::Connected);

    p.write_all(&[0xaa, 0xbb, 0xcc]).unwrap();
    assert_eq!(h.next(), Seen::Data(vec![0xaa, 0xbb, 0xcc]));

    drop(p);
    assert_eq!(h.next(), Seen::Disconnected);
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);
    h.assert_quiet();
}

#[test]
fn payloads_arrive_intact_and_in_order() {
    let (h, addr) = Harness::connected();
    let mut p = peer(addr);
    assert_eq!(h.next(), Seen::Connected);

    let payloads: Vec<Vec<u8>> = (0u8..16)
        .map(|i| (0..=i).map(|b| b.wrapping_mul(17)).chain([i, 0xff]).collect())
        .collect();

    for payload in &payloads {
        p.write_all(payload).unwrap();
        // Wait for delivery before the next send so the transport cannot coalesce them.
        assert_eq!(h.next(), Seen::Data(payload.clone()));
    }
}

#[test]
fn short_payloads_are_filtered() {
    let (h, addr) = Harness::connected();
    let mut p = peer(addr);
    assert_eq!(h.next(), Seen::Connected);

    p.write_all(&[0x07]).unwrap();
    h.assert_quiet();

    p.write_all(&[0x01, 0x02]).unwrap();
    assert_eq!(h.next(), Seen::Data(vec![0x01, 0x02]));
}

#[test]
fn scenario_single_peer_session() {
    let (h, addr) = Harness::connected();

    let mut p = peer(addr);
    assert_eq!(h.next(), Seen::Connected);

    p.write_all(&[0x01, 0x02]).unwrap();
    assert_eq!(h.next(), Seen::Data(vec![0x01, 0x02]));

    p.write_all(&[0x09]).unwrap();
    // The single byte is read and discarded; the close is the next thing the listener sees.
    thread::sleep(Duration::from_millis(50));
    drop(p);

    assert_eq!(h.next(), Seen::Disconnected);
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);
    h.assert_quiet();
}

#[test]
fn writes_reach_the_peer() {
    let (h, addr) = Harness::connected();
    let mut p = peer(addr);
    assert_eq!(h.next(), Seen::Connected);

    h.bridge.write("hi");
    h.bridge.write(vec![0x00, 0x01]);
    h.bridge.write_char('é');
    h.bridge.write_byte(b'!');
    h.bridge.try_write(b"end").unwrap();

    let mut expected = b"hi".to_vec();
    expected.extend_from_slice(&[0x00, 0x01]);
    expected.extend_from_slice("é".as_bytes());
    expected.extend_from_slice(b"!end");
    let mut got = vec![0u8; expected.len()];
    p.read_exact(&mut got).unwrap();
    assert_eq!(got, expected);
}

#[test]
fn write_while_disconnected_is_swallowed() {
    let (h, addr) = Harness::connected();

    h.bridge.write("nobody home");
    h.bridge.write_char('x');
    assert!(matches!(
        h.bridge.try_write(b"nobody"),
        Err(BridgeError::NotConnected)
    ));

    // Peer that already left.
    let p = peer(addr);
    assert_eq!(h.next(), Seen::Connected);
    drop(p);
    assert_eq!(h.next(), Seen::Disconnected);
    h.bridge.write("too late");
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);
}

#[test]
fn stop_without_peer_is_idempotent() {
    let (h, _addr) = Harness::connected();

    h.bridge.stop();
    assert_eq!(h.next(), Seen::Stopped);
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);
    assert_eq!(h.bridge.local_addr(), None);

    h.bridge.stop();
    h.assert_quiet();
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);
}

#[test]
fn stop_with_peer_disconnects_before_stopping() {
    let (h, addr) = Harness::connected();
    let mut p = peer(addr);
    assert_eq!(h.next(), Seen::Connected);

    h.bridge.stop();
    assert_eq!(h.next(), Seen::Disconnected);
    assert_eq!(h.next(), Seen::Stopped);
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);

    let mut buf = [0u8; 1];
    assert!(matches!(p.read(&mut buf), Ok(0) | Err(_)));
}

#[test]
fn reconnect_after_stop() {
    let (h, addr) = Harness::connected();
    h.bridge.stop();
    assert_eq!(h.next(), Seen::Stopped);

    h.bridge.connect_on(addr.port());
    assert_eq!(h.next(), Seen::Started);
    assert_eq!(h.bridge.local_addr(), Some(addr));

    let _p = peer(addr);
    assert_eq!(h.next(), Seen::Connected);
}

#[test]
fn connect_again_replaces_running_server() {
    let (h, first) = Harness::connected();
    let _p = peer(first);
    assert_eq!(h.next(), Seen::Connected);

    h.bridge.connect_on(0);
    assert_eq!(h.next(), Seen::Disconnected);
    assert_eq!(h.next(), Seen::Stopped);
    assert_eq!(h.next(), Seen::Started);

    assert!(h.bridge.local_addr().is_some());
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);
}

#[test]
fn stop_interrupts_write_to_stalled_peer() {
    let (h, addr) = Harness::connected();
    // Connected but never reads, so the send buffer fills and the write blocks.
    let _p = peer(addr);
    assert_eq!(h.next(), Seen::Connected);

    let bridge = &h.bridge;
    let (stopped_tx, stopped_rx) = bounded(1);
    thread::scope(|s| {
        let writer = s.spawn(move || bridge.try_write(&vec![0u8; 64 << 20]));
        thread::sleep(Duration::from_millis(500));

        s.spawn(move || {
            bridge.stop();
            let _ = stopped_tx.send(());
        });
        assert!(
            stopped_rx.recv_timeout(WAIT).is_ok(),
            "stop() waited on the blocked write"
        );

        let err = writer.join().unwrap().unwrap_err();
        assert!(
            matches!(err, BridgeError::Io(_) | BridgeError::NotConnected),
            "got {err:?}"
        );
    });

    assert_eq!(h.next(), Seen::Disconnected);
    assert_eq!(h.next(), Seen::Stopped);
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);
}

#[test]
fn writer_fails_cleanly_when_peer_leaves_mid_stream() {
    let (h, addr) = Harness::connected();
    let p = peer(addr);
    assert_eq!(h.next(), Seen::Connected);

    let bridge = &h.bridge;
    let (err_tx, err_rx) = bounded(1);
    thread::scope(|s| {
        s.spawn(move || {
            let chunk = vec![0x5au8; 64 * 1024];
            let err = loop {
                if let Err(e) = bridge.try_write(&chunk) {
                    break e;
                }
            };
            let _ = err_tx.send(err);
        });

        thread::sleep(Duration::from_millis(100));
        drop(p);

        let err = err_rx
            .recv_timeout(WAIT)
            .expect("writer saw the disconnect");
        assert!(
            matches!(err, BridgeError::Io(_) | BridgeError::NotConnected),
            "got {err:?}"
        );
    });

    assert_eq!(h.next(), Seen::Disconnected);
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);
    assert!(h.bridge.try_write(b"after").is_err());

    // The listener is still up for the next peer.
    let _again = peer(addr);
    assert_eq!(h.next(), Seen::Connected);
}

#[test]
fn port_in_use_leaves_bridge_disconnected() {
    let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    let h = Harness::new(DispatchMode::Thread);
    h.bridge.connect_on(port);
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);
    assert_eq!(h.bridge.local_addr(), None);
    h.assert_quiet();

    let err = h.bridge.try_connect_on(port).unwrap_err();
    assert!(matches!(err, BridgeError::Bind { .. }), "got {err:?}");
}

#[test]
fn concurrent_peer_is_turned_away() {
    let (h, addr) = Harness::connected();
    let mut first = peer(addr);
    assert_eq!(h.next(), Seen::Connected);

    let mut second = peer(addr);
    let mut buf = [0u8; 1];
    assert!(matches!(second.read(&mut buf), Ok(0) | Err(_)));
    h.assert_quiet();

    // The first peer is unaffected.
    first.write_all(b"still here").unwrap();
    assert_eq!(h.next(), Seen::Data(b"still here".to_vec()));
}

#[test]
fn manual_dispatch_runs_on_the_pumping_thread() {
    let h = Harness::new(DispatchMode::Manual);
    h.bridge.connect_on(0);
    let addr = h.bridge.local_addr().unwrap();

    let mut p = peer(addr);
    p.write_all(&[0x10, 0x20]).unwrap();
    drop(p);

    // Nothing is delivered until the embedding thread pumps.
    assert!(h.rx.recv_timeout(QUIET).is_err());
    assert_eq!(h.bridge.state(), ConnectionState::Disconnected);

    let mut seen = Vec::new();
    while seen.len() < 4 && h.bridge.dispatch_timeout(WAIT) {
        while let Ok((event, thread_id)) = h.rx.try_recv() {
            assert_eq!(thread_id, thread::current().id());
            seen.push(event);
        }
    }

    assert_eq!(
        seen,
        vec![
            Seen::Started,
            Seen::Connected,
            Seen::Data(vec![0x10, 0x20]),
            Seen::Disconnected,
        ]
    );
    assert_eq!(h.bridge.dispatch_pending(), 0);
}
