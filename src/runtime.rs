//! Runtime construction and thread orchestration.
//!
//! One [`Runtime`] owns a [`Node`] (registry, queues, socket server) and the
//! threads that drive it: N workers dispatching service messages, a socket
//! thread running the reactor, a timer thread pacing wakeups, and a
//! watchdog thread scanning for handlers that never return. Everything
//! winds down once the last service retires.

use crate::config::Config;
use crate::error::{Error, HandleError};
use crate::handle::{Handle, HandleRegistry};
use crate::mailbox::GlobalQueue;
use crate::message::{Message, MessageKind, Payload, Session};
use crate::monitor::WorkerMonitor;
use crate::service::{message_dispatch, Service, ServiceContext, ServiceStat};
use crate::socket::server::{create as create_socket_server, Polled, Reactor};
use crate::socket::{SocketId, SocketMessage, Sockets, UdpAddress};
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Instant;

/// Batch weights for the first 32 workers: a mix of single-message workers
/// (low latency) and fraction-draining workers (throughput). Workers past
/// 32 drain whole queues.
const WORKER_WEIGHTS: [i32; 32] = [
    -1, -1, -1, -1, 0, 0, 0, 0, //
    1, 1, 1, 1, 1, 1, 1, 1, //
    2, 2, 2, 2, 2, 2, 2, 2, //
    3, 3, 3, 3, 3, 3, 3, 3, //
];

/// The timer thread signals one sleeping worker at this pace, trading a
/// small latency floor against signalling on every push.
const TIMER_TICK: Duration = Duration::from_micros(2500);

/// The shared core of a running node: handle registry, global ready-queue
/// and the socket server's command side.
pub struct Node {
    pub(crate) registry: HandleRegistry,
    pub(crate) global: GlobalQueue,
    pub(crate) sockets: Sockets,
    pub(crate) profile: bool,
    /// Coarse clock in 10 ms ticks, advanced by the timer thread.
    now: AtomicU64,
    /// Back-reference handed to each spawned context.
    self_ref: Weak<Node>,
}

impl Node {
    pub(crate) fn global(&self) -> &GlobalQueue {
        &self.global
    }

    pub(crate) fn grab(&self, handle: Handle) -> Option<Arc<ServiceContext>> {
        self.registry.grab(handle)
    }

    /// Register a new service and make its mailbox schedulable.
    pub fn spawn(&self, service: impl Service + 'static) -> Result<Handle, Error> {
        let node = self.self_ref.upgrade().expect("node is alive while borrowed");
        let service: Box<dyn Service> = Box::new(service);

        let ctx = self
            .registry
            .register_with(move |handle| Arc::new(ServiceContext::new(handle, node, service)))?;

        self.global.push(Arc::clone(&ctx.mailbox));

        Ok(ctx.handle())
    }

    /// Send a message on behalf of the runtime (anonymous source).
    ///
    /// [`Session::Alloc`] needs a live sending context and is rejected
    /// here; use [`ServiceContext::send`] from inside a handler instead.
    pub fn send(
        &self,
        destination: Handle,
        kind: MessageKind,
        session: Session,
        payload: Payload,
    ) -> Result<i32, Error> {
        let session = match session {
            Session::None => 0,
            Session::Id(session) => session,
            Session::Alloc => return Err(HandleError::NoSessionSource.into()),
        };

        self.push_message(Handle::INVALID, destination, kind, session, payload)
    }

    /// Send to a named service.
    pub fn send_to_name(
        &self,
        name: &str,
        kind: MessageKind,
        session: Session,
        payload: Payload,
    ) -> Result<i32, Error> {
        let destination = self.lookup(name).ok_or(HandleError::BadDestination)?;

        self.send(destination, kind, session, payload)
    }

    /// Register a string alias for a service.
    pub fn name(&self, handle: Handle, name: &str) -> Result<(), Error> {
        Ok(self.registry.name(handle, name)?)
    }

    /// Resolve a string alias.
    pub fn lookup(&self, name: &str) -> Option<Handle> {
        self.registry.lookup(name)
    }

    /// Retire a service. Returns `false` when the handle is already gone.
    pub fn retire(&self, handle: Handle) -> bool {
        self.registry.retire(handle)
    }

    /// Retire every service, which shuts the runtime down.
    pub fn retire_all(&self) {
        self.registry.retire_all();
    }

    /// Number of live services.
    pub fn total(&self) -> usize {
        self.registry.total()
    }

    /// Counters for one service, or `None` when it is gone.
    pub fn stat(&self, handle: Handle) -> Option<ServiceStat> {
        self.grab(handle).map(|ctx| ctx.stat())
    }

    /// Coarse runtime clock in 10 ms ticks.
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    pub(crate) fn tick(&self, elapsed: Duration) {
        self.now.store(elapsed.as_millis() as u64 / 10, Ordering::Relaxed);
    }

    /// Route one message into the destination mailbox.
    pub(crate) fn push_message(
        &self,
        source: Handle,
        destination: Handle,
        kind: MessageKind,
        session: i32,
        payload: Payload,
    ) -> Result<i32, Error> {
        if !destination.is_valid() {
            if !payload.is_empty() {
                log::error!("destination address missing for message from {}", source);

                return Err(HandleError::BadDestination.into());
            }

            return Ok(session);
        }

        match self.grab(destination) {
            Some(ctx) => {
                let link = ctx.mailbox.push(Message {
                    source,
                    session,
                    kind,
                    payload,
                });

                if link {
                    self.global.push(Arc::clone(&ctx.mailbox));
                }

                Ok(session)
            }
            None => {
                drop(payload);

                // Answer the sender so a pending session cannot hang.
                if session != 0 && kind != MessageKind::Error {
                    let _ =
                        self.push_message(destination, source, MessageKind::Error, session, Payload::Empty);
                }

                Err(HandleError::Dead(destination).into())
            }
        }
    }

    /// Drop one undeliverable message, answering its sender when a reply
    /// was expected.
    pub(crate) fn dead_letter(&self, dying: Handle, message: Message) {
        let Message {
            source,
            session,
            kind,
            payload,
        } = message;

        drop(payload);

        if session != 0 && kind != MessageKind::Error {
            let _ = self.push_message(dying, source, MessageKind::Error, session, Payload::Empty);
        }
    }

    /// Deliver a reactor event into the owning service's mailbox.
    pub(crate) fn forward_socket(&self, owner: Handle, message: SocketMessage) {
        let Some(ctx) = self.grab(owner) else {
            log::debug!("socket event {} for dead service {}", message.id, owner);

            return;
        };

        let link = ctx.mailbox.push(Message {
            source: Handle::INVALID,
            session: 0,
            kind: MessageKind::Socket,
            payload: Payload::Socket(Box::new(message)),
        });

        if link {
            self.global.push(Arc::clone(&ctx.mailbox));
        }
    }

    pub(crate) fn socket_exit(&self) {
        self.sockets.exit();
    }

    /// Open a TCP listener owned by `owner`. The socket stays silent until
    /// [`start`](Node::start); the `Open` event then reports the bound
    /// address, so listening on port 0 is meaningful.
    pub fn listen(
        &self,
        owner: Handle,
        host: &str,
        port: u16,
        backlog: i32,
    ) -> Result<SocketId, Error> {
        Ok(self.sockets.listen(owner, host, port, backlog)?)
    }

    /// Begin a non-blocking connect owned by `owner`.
    pub fn connect(&self, owner: Handle, host: &str, port: u16) -> Result<SocketId, Error> {
        Ok(self.sockets.connect(owner, host, port)?)
    }

    /// Adopt an existing descriptor (for example stdin) as a socket.
    pub fn bind_fd(&self, owner: Handle, fd: RawFd) -> Result<SocketId, Error> {
        Ok(self.sockets.bind_fd(owner, fd)?)
    }

    /// Enable events for a prepared socket and claim ownership.
    pub fn start(&self, owner: Handle, id: SocketId) {
        self.sockets.start(owner, id);
    }

    /// Close after flushing pending writes.
    pub fn close(&self, owner: Handle, id: SocketId) {
        self.sockets.close(owner, id);
    }

    /// Close immediately, dropping pending writes.
    pub fn shutdown(&self, owner: Handle, id: SocketId) {
        self.sockets.shutdown(owner, id);
    }

    /// Queue bytes on a socket's high priority list.
    pub fn socket_send(&self, id: SocketId, data: impl Into<Box<[u8]>>) -> Result<(), Error> {
        Ok(self.sockets.send(id, data.into())?)
    }

    /// Queue bytes on a socket's low priority list.
    pub fn socket_send_lowpriority(
        &self,
        id: SocketId,
        data: impl Into<Box<[u8]>>,
    ) -> Result<(), Error> {
        Ok(self.sockets.send_lowpriority(id, data.into())?)
    }

    /// Set `TCP_NODELAY`.
    pub fn nodelay(&self, id: SocketId) {
        self.sockets.nodelay(id);
    }

    /// Open a UDP socket, bound to `local` when given.
    pub fn udp(&self, owner: Handle, local: Option<(&str, u16)>) -> Result<SocketId, Error> {
        Ok(self.sockets.udp(owner, local)?)
    }

    /// Send a datagram to an explicit peer.
    pub fn udp_send(
        &self,
        id: SocketId,
        to: UdpAddress,
        data: impl Into<Box<[u8]>>,
    ) -> Result<(), Error> {
        Ok(self.sockets.udp_send(id, to, data.into())?)
    }

    /// Set the default peer used by plain sends on a UDP socket.
    pub fn udp_connect(&self, id: SocketId, host: &str, port: u16) -> Result<(), Error> {
        Ok(self.sockets.udp_connect(id, host, port)?)
    }
}

struct SleepState {
    sleeping: usize,
    quit: bool,
}

/// Worker sleep/wakeup coordination plus the per-worker watchdog beacons.
pub(crate) struct Coordinator {
    count: usize,
    pub(crate) monitors: Vec<Arc<WorkerMonitor>>,
    sleep: Mutex<SleepState>,
    cond: Condvar,
}

impl Coordinator {
    fn new(count: usize) -> Self {
        Self {
            count,
            monitors: (0..count).map(|_| Arc::new(WorkerMonitor::new())).collect(),
            sleep: Mutex::new(SleepState {
                sleeping: 0,
                quit: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Signal one sleeping worker when at most `busy` workers may stay
    /// awake without it. A spurious signal is harmless.
    fn wakeup(&self, busy: usize) {
        let state = self.sleep.lock().expect("worker sleep state poisoned");

        if state.sleeping >= self.count - busy {
            self.cond.notify_one();
        }
    }

    fn quit(&self) {
        let mut state = self.sleep.lock().expect("worker sleep state poisoned");
        state.quit = true;
        self.cond.notify_all();
    }
}

/// A configured node plus the threads that will drive it.
///
/// Spawn the initial services first, then call [`run`](Runtime::run): the
/// runtime exits once every service has retired.
pub struct Runtime {
    node: Arc<Node>,
    reactor: Reactor,
    workers: usize,
    watchdog_interval: Duration,
}

impl Runtime {
    /// Build a node: registry, queues, then the socket server, in that
    /// order.
    pub fn new(config: Config) -> Result<Self, Error> {
        let registry = HandleRegistry::new(config.harbor);
        let global = GlobalQueue::new();
        let (sockets, reactor) = create_socket_server()?;

        let node = Arc::new_cyclic(|self_ref| Node {
            registry,
            global,
            sockets,
            profile: config.profile,
            now: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        });

        Ok(Self {
            node,
            reactor,
            workers: config.workers.max(1),
            watchdog_interval: config.watchdog_interval,
        })
    }

    /// The shared node, for spawning services and sending messages while
    /// the runtime runs on another thread.
    pub fn node(&self) -> Arc<Node> {
        Arc::clone(&self.node)
    }

    /// Register a new service.
    pub fn spawn(&self, service: impl Service + 'static) -> Result<Handle, Error> {
        self.node.spawn(service)
    }

    /// Start all threads and block until the last service retires.
    pub fn run(self) -> Result<(), Error> {
        let Runtime {
            node,
            reactor,
            workers,
            watchdog_interval,
        } = self;

        let coordinator = Arc::new(Coordinator::new(workers));
        let mut threads = Vec::with_capacity(workers + 3);

        {
            let node = Arc::clone(&node);
            let coordinator = Arc::clone(&coordinator);

            threads.push(
                thread::Builder::new()
                    .name("monitor".to_owned())
                    .spawn(move || monitor_main(&node, &coordinator, watchdog_interval))
                    .expect("create monitor thread"),
            );
        }

        {
            let node = Arc::clone(&node);
            let coordinator = Arc::clone(&coordinator);

            threads.push(
                thread::Builder::new()
                    .name("timer".to_owned())
                    .spawn(move || timer_main(&node, &coordinator))
                    .expect("create timer thread"),
            );
        }

        {
            let node = Arc::clone(&node);
            let coordinator = Arc::clone(&coordinator);

            threads.push(
                thread::Builder::new()
                    .name("socket".to_owned())
                    .spawn(move || socket_main(&node, &coordinator, reactor))
                    .expect("create socket thread"),
            );
        }

        for id in 0..workers {
            let node = Arc::clone(&node);
            let coordinator = Arc::clone(&coordinator);
            let monitor = Arc::clone(&coordinator.monitors[id]);
            let weight = WORKER_WEIGHTS.get(id).copied().unwrap_or(0);

            threads.push(
                thread::Builder::new()
                    .name(format!("worker-{}", id))
                    .spawn(move || worker_main(&node, &coordinator, &monitor, weight))
                    .expect("create worker thread"),
            );
        }

        for thread in threads {
            if thread.join().is_err() {
                log::error!("runtime thread panicked");
            }
        }

        Ok(())
    }
}

/// Watchdog: scan every worker beacon on the configured interval and flag
/// the destination of any dispatch that spans two scans.
fn monitor_main(node: &Node, coordinator: &Coordinator, interval: Duration) {
    let slice = Duration::from_millis(100);

    loop {
        if node.total() == 0 {
            break;
        }

        for monitor in &coordinator.monitors {
            if let Some((source, destination)) = monitor.check() {
                if let Some(ctx) = node.grab(destination) {
                    ctx.mark_endless();
                }

                log::error!(
                    "a message from {} to {} maybe in an endless loop",
                    source,
                    destination
                );
            }
        }

        // Sleep in slices so shutdown stays prompt.
        let mut waited = Duration::ZERO;
        while waited < interval {
            if node.total() == 0 {
                return;
            }

            thread::sleep(slice);
            waited += slice;
        }
    }
}

/// Timer: advance the coarse clock and nudge one sleeping worker every
/// tick. On shutdown it stops the reactor and releases the workers.
fn timer_main(node: &Node, coordinator: &Coordinator) {
    let started = Instant::now();

    loop {
        node.tick(started.elapsed());

        if node.total() == 0 {
            break;
        }

        coordinator.wakeup(coordinator.count.saturating_sub(1));
        thread::sleep(TIMER_TICK);
    }

    // Wake the reactor so the socket thread exits, then the workers.
    node.socket_exit();
    coordinator.quit();
}

/// Socket thread: run the reactor, forwarding each event into the owning
/// service's mailbox.
fn socket_main(node: &Node, coordinator: &Coordinator, mut reactor: Reactor) {
    loop {
        match reactor.poll() {
            Polled::Exit => break,
            Polled::Failed => {
                if node.total() == 0 {
                    break;
                }
            }
            Polled::Message(owner, message) => {
                node.forward_socket(owner, message);

                // If every worker is asleep, one must get up for this.
                coordinator.wakeup(0);
            }
        }
    }
}

/// Worker: dispatch until the global queue runs dry, then sleep on the
/// condvar until the timer or the socket thread signals.
fn worker_main(
    node: &Arc<Node>,
    coordinator: &Coordinator,
    monitor: &WorkerMonitor,
    weight: i32,
) {
    let mut mailbox = None;

    loop {
        mailbox = message_dispatch(node, monitor, mailbox, weight);

        if mailbox.is_none() {
            let mut state = coordinator.sleep.lock().expect("worker sleep state poisoned");

            if state.quit {
                break;
            }

            state.sleeping += 1;
            // Spurious wakeups are harmless; dispatch copes with an empty
            // queue.
            state = coordinator
                .cond
                .wait(state)
                .expect("worker sleep state poisoned");
            state.sleeping -= 1;

            if state.quit {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MessageKind, Payload, Session};
    use crate::service::ServiceContext;

    fn runtime() -> Runtime {
        Runtime::new(Config::default()).unwrap()
    }

    fn sink() -> impl Fn(&ServiceContext, Message) + Send {
        |_: &ServiceContext, _: Message| {}
    }

    #[test]
    fn spawn_assigns_unique_handles() {
        let runtime = runtime();
        let node = runtime.node();

        let mut handles = Vec::new();
        // Enough to force several registry growth steps.
        for _ in 0..100 {
            handles.push(node.spawn(sink()).unwrap());
        }

        let mut deduped = handles.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), handles.len());

        for handle in &handles {
            assert!(node.stat(*handle).is_some());
        }

        assert_eq!(node.total(), 100);
        node.retire_all();
        assert_eq!(node.total(), 0);
    }

    #[test]
    fn retired_handles_resolve_to_none() {
        let runtime = runtime();
        let node = runtime.node();

        let handle = node.spawn(sink()).unwrap();
        assert!(node.retire(handle));
        assert!(!node.retire(handle));
        assert!(node.stat(handle).is_none());
    }

    #[test]
    fn names_are_unique_and_searchable() {
        let runtime = runtime();
        let node = runtime.node();

        let a = node.spawn(sink()).unwrap();
        let b = node.spawn(sink()).unwrap();

        node.name(a, "alpha").unwrap();
        node.name(b, "beta").unwrap();

        assert_eq!(node.lookup("alpha"), Some(a));
        assert_eq!(node.lookup("beta"), Some(b));
        assert_eq!(node.lookup("gamma"), None);
        assert!(node.name(b, "alpha").is_err());

        // Retiring removes the alias with the service.
        node.retire(a);
        assert_eq!(node.lookup("alpha"), None);
    }

    #[test]
    fn send_to_dead_service_is_reported() {
        let runtime = runtime();
        let node = runtime.node();

        let handle = node.spawn(sink()).unwrap();
        node.retire(handle);

        let result = node.send(handle, MessageKind::Text, Session::None, Payload::from("hi"));
        assert!(result.is_err());
    }

    #[test]
    fn weight_table_mixes_drain_policies() {
        assert_eq!(WORKER_WEIGHTS.len(), 32);
        assert_eq!(WORKER_WEIGHTS.iter().filter(|w| **w == -1).count(), 4);
        assert_eq!(WORKER_WEIGHTS.iter().filter(|w| **w == 0).count(), 4);
        assert_eq!(WORKER_WEIGHTS.iter().filter(|w| **w == 1).count(), 8);
        assert_eq!(WORKER_WEIGHTS.iter().filter(|w| **w == 2).count(), 8);
        assert_eq!(WORKER_WEIGHTS.iter().filter(|w| **w == 3).count(), 8);
    }
}
