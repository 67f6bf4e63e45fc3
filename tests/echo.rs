//! End to end TCP echo through the reactor: listen, start, accept, data in
//! both directions, clean close.

use apiary::{
    Config, Message, MessageKind, Payload, Runtime, ServiceContext, SocketMessage, SocketEvent,
};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn tcp_echo_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let runtime = Runtime::new(Config {
        workers: 2,
        ..Default::default()
    })
    .unwrap();
    let node = runtime.node();

    let (addr_tx, addr_rx) = mpsc::channel::<String>();
    let (event_tx, event_rx) = mpsc::channel::<String>();

    let gate = runtime
        .spawn(move |ctx: &ServiceContext, msg: Message| {
            let Payload::Socket(socket_msg) = msg.payload else {
                return;
            };
            let SocketMessage { id, event } = *socket_msg;

            match event {
                SocketEvent::Open { info } => {
                    // The listener's start event reports the bound address.
                    if info.contains(':') {
                        addr_tx.send(info).unwrap();
                    }
                }
                SocketEvent::Accept { peer, .. } => {
                    event_tx.send("accept".to_owned()).unwrap();
                    ctx.start(peer);
                }
                SocketEvent::Data { payload } => {
                    event_tx.send(format!("data:{}", payload.len())).unwrap();
                    ctx.socket_send(id, payload).unwrap();
                }
                SocketEvent::Error { reason } => {
                    event_tx.send(format!("error:{}", reason)).unwrap();
                }
                _ => {}
            }
        })
        .unwrap();

    let listener = node.listen(gate, "127.0.0.1", 0, 32).unwrap();
    node.start(gate, listener);

    let runner = thread::spawn(move || runtime.run());

    let addr = addr_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    stream.write_all(b"hello").unwrap();

    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello");

    drop(stream);

    // Exactly one accept and one inbound data message, no errors.
    let mut accepts = 0;
    let mut data_messages = 0;

    while let Ok(tag) = event_rx.recv_timeout(Duration::from_millis(500)) {
        match tag.as_str() {
            "accept" => accepts += 1,
            "data:5" => data_messages += 1,
            other => panic!("unexpected socket activity: {}", other),
        }
    }

    assert_eq!(accepts, 1);
    assert_eq!(data_messages, 1);

    node.retire_all();
    runner.join().unwrap().unwrap();
}
