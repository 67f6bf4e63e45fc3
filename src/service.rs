//! Service contexts and message dispatch.

use crate::error::Error;
use crate::handle::Handle;
use crate::mailbox::Mailbox;
use crate::message::{Message, MessageKind, Payload, Session};
use crate::monitor::WorkerMonitor;
use crate::runtime::Node;
use crate::socket::{SocketId, UdpAddress};
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;
use std::os::fd::RawFd;
use std::sync::Arc;

thread_local! {
    static DISPATCHING: Cell<u32> = const { Cell::new(0) };
}

/// The handle of the service currently dispatching on the calling thread,
/// or [`Handle::INVALID`] outside a handler.
pub fn current_handle() -> Handle {
    Handle::from_raw(DISPATCHING.with(|current| current.get()))
}

/// A message handler hosted by the runtime.
///
/// Handlers run to completion: a service is advanced by dispatching exactly
/// one message at a time, and no two messages for the same service are ever
/// dispatched concurrently. The message is passed by value; dropping it
/// frees the payload, moving the payload out keeps it.
pub trait Service: Send {
    /// Handle one message.
    fn message(&mut self, ctx: &ServiceContext, message: Message);
}

impl<F> Service for F
where
    F: FnMut(&ServiceContext, Message) + Send,
{
    fn message(&mut self, ctx: &ServiceContext, message: Message) {
        self(ctx, message)
    }
}

/// Point-in-time counters for one service, see [`Node::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStat {
    /// Messages dispatched so far.
    pub message_count: u64,
    /// Accumulated handler CPU time. Zero unless profiling is enabled.
    pub cpu: Duration,
    /// Set by the watchdog when a handler is suspected to never return.
    pub endless: bool,
    /// Current mailbox length.
    pub mailbox_len: usize,
    /// Last mailbox length that breached the overload threshold.
    pub overload: usize,
}

/// The runtime-side state of one service.
///
/// A reference to the context is handed to the service's handler on every
/// dispatch; it is the service's door back into the runtime for sending
/// messages, spawning siblings and driving sockets.
pub struct ServiceContext {
    handle: Handle,
    node: Arc<Node>,
    pub(crate) mailbox: Arc<Mailbox>,
    service: spin::Mutex<Box<dyn Service>>,
    session_id: AtomicI32,
    endless: AtomicBool,
    message_count: AtomicU64,
    cpu_micros: AtomicU64,
    overload: AtomicUsize,
}

impl ServiceContext {
    pub(crate) fn new(handle: Handle, node: Arc<Node>, service: Box<dyn Service>) -> Self {
        Self {
            handle,
            node,
            mailbox: Arc::new(Mailbox::new(handle)),
            service: spin::Mutex::new(service),
            session_id: AtomicI32::new(0),
            endless: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
            cpu_micros: AtomicU64::new(0),
            overload: AtomicUsize::new(0),
        }
    }

    /// This service's address.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Send a message to another service (or to self).
    ///
    /// Returns the session the message carries: 0 for fire-and-forget, the
    /// allocated token for [`Session::Alloc`].
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
            Session::Alloc => self.new_session(),
        };

        self.node
            .push_message(self.handle, destination, kind, session, payload)
    }

    /// Send to a named service.
    pub fn send_to_name(
        &self,
        name: &str,
        kind: MessageKind,
        session: Session,
        payload: Payload,
    ) -> Result<i32, Error> {
        let destination = self
            .node
            .lookup(name)
            .ok_or(crate::error::HandleError::BadDestination)?;

        self.send(destination, kind, session, payload)
    }

    /// Allocate a reply token. Tokens are positive and wrap back to 1.
    pub fn new_session(&self) -> i32 {
        let session = self.session_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        if session <= 0 {
            self.session_id.store(1, Ordering::Relaxed);

            return 1;
        }

        session
    }

    /// Spawn a sibling service.
    pub fn spawn(&self, service: impl Service + 'static) -> Result<Handle, Error> {
        self.node.spawn(service)
    }

    /// Retire this service. In-flight messages drain before the mailbox is
    /// dropped; senders with pending sessions receive error replies.
    pub fn exit(&self) {
        self.node.retire(self.handle);
    }

    /// Retire another service.
    pub fn retire(&self, handle: Handle) -> bool {
        self.node.retire(handle)
    }

    /// Coarse runtime clock in 10 ms ticks.
    pub fn now(&self) -> u64 {
        self.node.now()
    }

    /// Messages dispatched so far.
    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Accumulated handler CPU time (needs the profile config flag).
    pub fn cpu_time(&self) -> Duration {
        Duration::from_micros(self.cpu_micros.load(Ordering::Relaxed))
    }

    /// Set when the watchdog suspects a handler of never returning.
    pub fn is_endless(&self) -> bool {
        self.endless.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_endless(&self) {
        self.endless.store(true, Ordering::Relaxed);
    }

    pub(crate) fn note_overload(&self, length: usize) {
        self.overload.store(length, Ordering::Relaxed);
    }

    pub(crate) fn stat(&self) -> ServiceStat {
        ServiceStat {
            message_count: self.message_count(),
            cpu: self.cpu_time(),
            endless: self.is_endless(),
            mailbox_len: self.mailbox.len(),
            overload: self.overload.load(Ordering::Relaxed),
        }
    }

    /// Open a TCP listener owned by this service. See [`Node::listen`].
    pub fn listen(&self, host: &str, port: u16, backlog: i32) -> Result<SocketId, Error> {
        self.node.listen(self.handle, host, port, backlog)
    }

    /// Begin a non-blocking TCP connect owned by this service.
    pub fn connect(&self, host: &str, port: u16) -> Result<SocketId, Error> {
        self.node.connect(self.handle, host, port)
    }

    /// Adopt an existing descriptor (for example stdin) as a socket.
    pub fn bind_fd(&self, fd: RawFd) -> Result<SocketId, Error> {
        self.node.bind_fd(self.handle, fd)
    }

    /// Enable events for a prepared socket and claim ownership of it.
    pub fn start(&self, id: SocketId) {
        self.node.start(self.handle, id);
    }

    /// Close a socket after flushing pending writes.
    pub fn close(&self, id: SocketId) {
        self.node.close(self.handle, id);
    }

    /// Close a socket immediately, dropping pending writes.
    pub fn shutdown(&self, id: SocketId) {
        self.node.shutdown(self.handle, id);
    }

    /// Queue bytes on a socket's high priority list.
    pub fn socket_send(&self, id: SocketId, data: impl Into<Box<[u8]>>) -> Result<(), Error> {
        self.node.socket_send(id, data)
    }

    /// Queue bytes on a socket's low priority list.
    pub fn socket_send_lowpriority(
        &self,
        id: SocketId,
        data: impl Into<Box<[u8]>>,
    ) -> Result<(), Error> {
        self.node.socket_send_lowpriority(id, data)
    }

    /// Set `TCP_NODELAY` on a socket.
    pub fn nodelay(&self, id: SocketId) {
        self.node.nodelay(id);
    }

    /// Open a UDP socket, optionally bound to a local address.
    pub fn udp(&self, local: Option<(&str, u16)>) -> Result<SocketId, Error> {
        self.node.udp(self.handle, local)
    }

    /// Send a datagram to an explicit peer.
    pub fn udp_send(
        &self,
        id: SocketId,
        to: UdpAddress,
        data: impl Into<Box<[u8]>>,
    ) -> Result<(), Error> {
        self.node.udp_send(id, to, data)
    }

    /// Set the default peer used by plain sends on a UDP socket.
    pub fn udp_connect(&self, id: SocketId, host: &str, port: u16) -> Result<(), Error> {
        self.node.udp_connect(id, host, port)
    }

    /// Run one handler invocation. The service lock is uncontended by
    /// construction: `in_global` guarantees a single worker per mailbox.
    pub(crate) fn dispatch(&self, message: Message) {
        DISPATCHING.with(|current| current.set(self.handle.raw()));
        self.message_count.fetch_add(1, Ordering::Relaxed);

        let mut service = self
            .service
            .try_lock()
            .expect("mailbox dispatched by two workers");

        if self.node.profile {
            let start = thread_cpu_micros();
            service.message(self, message);
            self.cpu_micros
                .fetch_add(thread_cpu_micros().saturating_sub(start), Ordering::Relaxed);
        } else {
            service.message(self, message);
        }
    }
}

impl Drop for ServiceContext {
    fn drop(&mut self) {
        // Last reference gone: no further grabs, no further pushes. Requeue
        // the mailbox one final time so a worker drains and drops it.
        if self.mailbox.mark_release() {
            self.node.global().push(Arc::clone(&self.mailbox));
        }
    }
}

/// One worker iteration: take a ready mailbox, drain a weighted batch of
/// messages through the owning service's handler, then either requeue the
/// mailbox (still non-empty) or leave it idle.
///
/// Returns the mailbox to keep working on, or `None` when the global queue
/// is empty and the worker should sleep.
pub(crate) fn message_dispatch(
    node: &Arc<Node>,
    monitor: &WorkerMonitor,
    fetched: Option<Arc<Mailbox>>,
    weight: i32,
) -> Option<Arc<Mailbox>> {
    let mailbox = match fetched {
        Some(mailbox) => mailbox,
        None => node.global().pop()?,
    };

    let handle = mailbox.handle();

    let Some(ctx) = node.grab(handle) else {
        // Owner is gone; drain the stragglers and answer their senders, or
        // park the mailbox again if its teardown has not caught up yet.
        if mailbox.release_or_requeue(|message| node.dead_letter(handle, message)) {
            node.global().push(Arc::clone(&mailbox));
        }

        return node.global().pop();
    };

    // A negative weight drains exactly one message. Weight w >= 0 drains
    // len >> w of the length remaining after the first pop, so weight 0
    // empties deep queues while weight 3 takes an eighth of one.
    let mut batch = 1usize;
    let mut i = 0usize;

    while i < batch {
        let Some(message) = mailbox.pop() else {
            // Drained; `pop` already marked the mailbox idle.
            return node.global().pop();
        };

        if i == 0 && weight >= 0 {
            batch = mailbox.len() >> (weight as u32);
        }

        let overload = mailbox.take_overload();
        if overload > 0 {
            log::warn!(
                "service {} may overload, message queue length = {}",
                handle,
                overload
            );
            ctx.note_overload(overload);
        }

        monitor.trigger(message.source, handle);
        ctx.dispatch(message);
        monitor.trigger(Handle::INVALID, Handle::INVALID);

        i += 1;
    }

    match node.global().pop() {
        Some(next) => {
            node.global().push(mailbox);

            Some(next)
        }
        None => Some(mailbox),
    }
}

#[cfg(unix)]
fn thread_cpu_micros() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    // SAFETY: `ts` is a valid out-pointer for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return 0;
    }

    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}
