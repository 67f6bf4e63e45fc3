//! Write queue semantics observed from a real peer: priority ordering,
//! half-close flushing and the UDP paths.

use apiary::{
    Config, Message, MessageKind, Payload, Runtime, ServiceContext, Session, SocketEvent,
    SocketId, SocketMessage, UdpAddress,
};
use std::io::Read;
use std::net::{TcpStream, UdpSocket};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// A gateway that listens, reports its bound address and hands each
/// established connection to `on_ready`.
fn gateway<F>(
    runtime: &Runtime,
    addr_tx: mpsc::Sender<String>,
    close_tx: mpsc::Sender<()>,
    mut on_ready: F,
) -> apiary::Handle
where
    F: FnMut(&ServiceContext, SocketId) + Send + 'static,
{
    runtime
        .spawn(move |ctx: &ServiceContext, msg: Message| {
            let Payload::Socket(socket_msg) = msg.payload else {
                return;
            };
            let SocketMessage { id, event } = *socket_msg;

            match event {
                SocketEvent::Open { info } => {
                    if info.contains(':') {
                        addr_tx.send(info).unwrap();
                    } else if info == "start" {
                        on_ready(ctx, id);
                    }
                }
                SocketEvent::Accept { peer, .. } => {
                    ctx.start(peer);
                }
                SocketEvent::Close => {
                    close_tx.send(()).unwrap();
                }
                SocketEvent::Error { reason } => {
                    panic!("unexpected socket error: {}", reason);
                }
                _ => {}
            }
        })
        .unwrap()
}

#[test]
fn high_priority_overtakes_queued_low_writes() {
    init();

    const LOW_CHUNK: usize = 256 * 1024;
    const LOW_COUNT: usize = 100;

    let runtime = Runtime::new(Config {
        workers: 2,
        ..Default::default()
    })
    .unwrap();
    let node = runtime.node();

    let (addr_tx, addr_rx) = mpsc::channel();
    let (close_tx, _close_rx) = mpsc::channel();
    let (queued_tx, queued_rx) = mpsc::channel::<()>();

    let gate = gateway(&runtime, addr_tx, close_tx, move |ctx, id| {
        // Flood the low priority list far beyond the kernel buffers, then
        // queue one small high priority write behind the backlog.
        for _ in 0..LOW_COUNT {
            ctx.socket_send_lowpriority(id, vec![b'L'; LOW_CHUNK]).unwrap();
        }
        ctx.socket_send(id, vec![b'H'; 16]).unwrap();
        ctx.close(id);

        queued_tx.send(()).unwrap();
    });

    let listener = node.listen(gate, "127.0.0.1", 0, 32).unwrap();
    node.start(gate, listener);

    let runner = thread::spawn(move || runtime.run());

    let addr = addr_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let mut stream = TcpStream::connect(&addr).unwrap();
    stream.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();

    // Hold off reading until the whole backlog is queued reactor-side.
    queued_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).unwrap();

    assert_eq!(bytes.len(), LOW_COUNT * LOW_CHUNK + 16);

    // The high priority payload must land before the queued low traffic,
    // right after whichever low transfer was already in flight completed.
    let first_high = bytes.iter().position(|b| *b == b'H').unwrap();
    let last_low = bytes.iter().rposition(|b| *b == b'L').unwrap();

    assert!(
        first_high < last_low,
        "high priority bytes arrived after the low priority backlog"
    );

    node.retire_all();
    runner.join().unwrap().unwrap();
}

#[test]
fn close_flushes_pending_writes_then_dies() {
    init();

    const CHUNK: usize = 4 * 1024 * 1024;
    const CHUNKS: usize = 8;

    let runtime = Runtime::new(Config {
        workers: 2,
        ..Default::default()
    })
    .unwrap();
    let node = runtime.node();

    let (addr_tx, addr_rx) = mpsc::channel();
    let (close_tx, close_rx) = mpsc::channel();
    let (queued_tx, queued_rx) = mpsc::channel::<()>();

    let gate = gateway(&runtime, addr_tx, close_tx, move |ctx, id| {
        for _ in 0..CHUNKS {
            ctx.socket_send(id, vec![b'D'; CHUNK]).unwrap();
        }
        ctx.close(id);

        // Anything sent after close must be discarded, not delivered.
        let _ = ctx.socket_send(id, vec![b'X'; 64 * 1024]);

        queued_tx.send(()).unwrap();
    });

    let listener = node.listen(gate, "127.0.0.1", 0, 32).unwrap();
    node.start(gate, listener);

    let runner = thread::spawn(move || runtime.run());

    let addr = addr_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let mut stream = TcpStream::connect(&addr).unwrap();
    stream.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();

    queued_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    // The half closed socket must flush everything queued before the
    // close, then end the stream.
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).unwrap();

    assert_eq!(bytes.len(), CHUNKS * CHUNK);
    assert!(bytes.iter().all(|b| *b == b'D'));

    // Exactly one close event, nothing after it.
    close_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(close_rx.recv_timeout(Duration::from_millis(500)).is_err());

    node.retire_all();
    runner.join().unwrap().unwrap();
}

#[test]
fn udp_round_trip_and_default_peer() {
    init();

    let runtime = Runtime::new(Config {
        workers: 2,
        ..Default::default()
    })
    .unwrap();
    let node = runtime.node();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    let client_addr = client.local_addr().unwrap();
    client.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();

    let (got_tx, got_rx) = mpsc::channel::<(Vec<u8>, String)>();

    let service = runtime
        .spawn(move |ctx: &ServiceContext, msg: Message| match msg.payload {
            Payload::Socket(socket_msg) => {
                let SocketMessage { id, event } = *socket_msg;

                if let SocketEvent::Udp { payload, from } = event {
                    got_tx.send((payload.to_vec(), from.to_string())).unwrap();

                    // Answer through the default peer instead of an
                    // explicit address.
                    ctx.udp_connect(id, "127.0.0.1", client_addr.port()).unwrap();
                    ctx.socket_send(id, b"pong2".as_slice()).unwrap();
                }
            }
            _ if msg.kind == MessageKind::Text => {
                let id = ctx.udp(None).unwrap();
                ctx.udp_send(id, UdpAddress::from(client_addr), b"ping".as_slice())
                    .unwrap();
            }
            _ => {}
        })
        .unwrap();

    let runner = thread::spawn(move || runtime.run());

    node.send(service, MessageKind::Text, Session::None, Payload::Empty)
        .unwrap();

    let mut buf = [0u8; 64];
    let (n, service_addr) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    client.send_to(b"pong", service_addr).unwrap();

    let (payload, from) = got_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(payload, b"pong");
    assert_eq!(from, client_addr.to_string());

    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong2");

    node.retire_all();
    runner.join().unwrap().unwrap();
}
