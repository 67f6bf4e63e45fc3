//! The watchdog must flag a handler that never returns while the rest of
//! the node keeps dispatching.

use apiary::{Config, Message, MessageKind, Payload, Runtime, ServiceContext, Session};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn watchdog_flags_endless_handler() {
    let _ = env_logger::builder().is_test(true).try_init();

    let runtime = Runtime::new(Config {
        workers: 2,
        watchdog_interval: Duration::from_millis(200),
        ..Default::default()
    })
    .unwrap();
    let node = runtime.node();

    let spinner = runtime
        .spawn(|_: &ServiceContext, _: Message| {
            thread::sleep(Duration::from_secs(3));
        })
        .unwrap();

    let (tx, rx) = mpsc::channel::<i32>();
    let echo = runtime
        .spawn(move |_: &ServiceContext, msg: Message| {
            if msg.kind == MessageKind::Text {
                tx.send(msg.session).unwrap();
            }
        })
        .unwrap();

    let runner = thread::spawn(move || runtime.run());

    node.send(spinner, MessageKind::Text, Session::None, Payload::Empty)
        .unwrap();

    // While one worker hangs in the spinner, the echo service must keep
    // answering and the watchdog must notice the stuck dispatch.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut round = 0;

    let flagged = loop {
        round += 1;
        node.send(echo, MessageKind::Text, Session::Id(round), Payload::Empty)
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            round,
            "other services stalled alongside the endless handler"
        );

        if node.stat(spinner).unwrap().endless {
            break true;
        }

        if Instant::now() > deadline {
            break false;
        }

        thread::sleep(Duration::from_millis(50));
    };

    assert!(flagged, "endless handler was never flagged");

    node.retire_all();
    runner.join().unwrap().unwrap();
}
