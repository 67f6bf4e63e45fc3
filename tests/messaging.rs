//! Message routing behaviour observable through the public API.

use apiary::{
    Config, Handle, Message, MessageKind, Payload, Runtime, ServiceContext, Session,
};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn self_send_round_trips_identity() {
    init();

    let runtime = Runtime::new(Config {
        workers: 2,
        ..Default::default()
    })
    .unwrap();
    let node = runtime.node();

    let (tx, rx) = mpsc::channel::<(Handle, i32, Vec<u8>)>();

    let service = runtime
        .spawn(move |ctx: &ServiceContext, msg: Message| match msg.kind {
            MessageKind::Text => {
                ctx.send(
                    ctx.handle(),
                    MessageKind::Client,
                    Session::Id(77),
                    Payload::from(b"ping".as_slice()),
                )
                .unwrap();
            }
            MessageKind::Client => {
                let bytes = msg.payload.as_bytes().unwrap_or_default().to_vec();
                tx.send((msg.source, msg.session, bytes)).unwrap();
            }
            _ => {}
        })
        .unwrap();

    let runner = thread::spawn(move || runtime.run());

    node.send(service, MessageKind::Text, Session::None, Payload::Empty)
        .unwrap();

    let (source, session, bytes) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(source, service);
    assert_eq!(session, 77);
    assert_eq!(bytes, b"ping");

    node.retire_all();
    runner.join().unwrap().unwrap();
}

#[test]
fn per_sender_fifo_order() {
    init();

    let runtime = Runtime::new(Config {
        workers: 4,
        ..Default::default()
    })
    .unwrap();
    let node = runtime.node();

    let (tx, rx) = mpsc::channel::<i32>();

    let receiver = runtime
        .spawn(move |_: &ServiceContext, msg: Message| {
            if msg.kind == MessageKind::Text {
                tx.send(msg.session).unwrap();
            }
        })
        .unwrap();

    let runner = thread::spawn(move || runtime.run());

    for n in 1..=500 {
        node.send(receiver, MessageKind::Text, Session::Id(n), Payload::Empty)
            .unwrap();
    }

    for n in 1..=500 {
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), n);
    }

    node.retire_all();
    runner.join().unwrap().unwrap();
}

#[test]
fn dead_service_send_answers_with_error_session() {
    init();

    let runtime = Runtime::new(Config {
        workers: 2,
        ..Default::default()
    })
    .unwrap();
    let node = runtime.node();

    let victim = runtime
        .spawn(|_: &ServiceContext, _: Message| {})
        .unwrap();

    let (session_tx, session_rx) = mpsc::channel::<i32>();
    let (error_tx, error_rx) = mpsc::channel::<(Handle, i32)>();

    let requester = runtime
        .spawn(move |ctx: &ServiceContext, msg: Message| match msg.kind {
            MessageKind::Text => {
                let session = ctx.new_session();
                session_tx.send(session).unwrap();

                // The destination is already gone, so this fails and the
                // runtime answers with an error carrying our session.
                let _ = ctx.send(
                    victim,
                    MessageKind::Text,
                    Session::Id(session),
                    Payload::from("ping"),
                );
            }
            MessageKind::Error => {
                error_tx.send((msg.source, msg.session)).unwrap();
            }
            _ => {}
        })
        .unwrap();

    let runner = thread::spawn(move || runtime.run());

    assert!(node.retire(victim));

    node.send(requester, MessageKind::Text, Session::None, Payload::Empty)
        .unwrap();

    let sent_session = session_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let (error_source, error_session) = error_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    assert_eq!(error_session, sent_session);
    assert_eq!(error_source, victim);

    node.retire_all();
    runner.join().unwrap().unwrap();
}

#[test]
fn mailbox_overload_is_recorded_and_drains() {
    init();

    let runtime = Runtime::new(Config {
        workers: 2,
        ..Default::default()
    })
    .unwrap();
    let node = runtime.node();

    let slow = runtime
        .spawn(|_: &ServiceContext, _: Message| {
            thread::sleep(Duration::from_millis(1));
        })
        .unwrap();

    // Burst before the workers start so the whole backlog is visible on
    // the first dispatch.
    for _ in 0..4096 {
        node.send(slow, MessageKind::Text, Session::None, Payload::Empty)
            .unwrap();
    }

    let runner = thread::spawn(move || runtime.run());

    let deadline = Instant::now() + Duration::from_secs(120);
    loop {
        let stat = node.stat(slow).unwrap();

        if stat.message_count == 4096 {
            assert_eq!(stat.mailbox_len, 0);
            assert!(
                stat.overload > 1024,
                "expected an overload beyond the initial threshold, got {}",
                stat.overload
            );

            break;
        }

        assert!(Instant::now() < deadline, "burst did not drain");
        thread::sleep(Duration::from_millis(50));
    }

    node.retire_all();
    runner.join().unwrap().unwrap();
}

#[test]
fn profile_accumulates_handler_cpu_time() {
    init();

    let runtime = Runtime::new(Config {
        workers: 2,
        profile: true,
        ..Default::default()
    })
    .unwrap();
    let node = runtime.node();

    let (tx, rx) = mpsc::channel::<()>();

    let busy = runtime
        .spawn(move |_: &ServiceContext, _: Message| {
            // Spin a little so the CPU clock visibly advances.
            let until = Instant::now() + Duration::from_millis(20);
            while Instant::now() < until {
                std::hint::black_box(0u64);
            }

            tx.send(()).unwrap();
        })
        .unwrap();

    let runner = thread::spawn(move || runtime.run());

    node.send(busy, MessageKind::Text, Session::None, Payload::Empty)
        .unwrap();
    rx.recv_timeout(RECV_TIMEOUT).unwrap();

    let stat = node.stat(busy).unwrap();
    assert_eq!(stat.message_count, 1);
    assert!(stat.cpu > Duration::ZERO, "cpu time was not accumulated");

    node.retire_all();
    runner.join().unwrap().unwrap();
}
