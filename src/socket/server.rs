//! The reactor: a single thread owning every socket descriptor.
//!
//! The outer loop multiplexes between draining the command queue and
//! polling ready descriptors. Each socket walks the state machine in
//! [`SlotState`](super::slot::SlotState); results are surfaced as
//! [`SocketMessage`]s addressed to the owning service.

use crate::handle::Handle;
use crate::socket::buffer::WriteBuffer;
use crate::socket::pipe::{CommandQueue, Request};
use crate::socket::poll::{PollEvent, Poller, Readiness};
use crate::socket::slot::{
    slot_index, Protocol, Slot, SlotState, MAX_SOCKET, MIN_READ_BUFFER,
};
use crate::socket::{sys, SocketEvent, SocketId, SocketMessage, Sockets, UdpAddress};
use crate::error::SocketError;
use core::sync::atomic::{AtomicI32, Ordering};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Ready descriptors taken per poll.
const MAX_EVENT: usize = 64;
/// Aggregate write buffer size that triggers the first warning.
const WARNING_SIZE: u64 = 1024 * 1024;
/// Largest datagram we can receive.
const MAX_UDP_PACKAGE: usize = 65535;
/// Poll key of the self-pipe read end.
const CTRL_KEY: usize = usize::MAX;

/// State shared between the caller-side API and the reactor.
pub(crate) struct SocketShared {
    slots: Vec<Slot>,
    alloc_id: AtomicI32,
    pub(crate) ctrl: CommandQueue,
}

impl SocketShared {
    fn new(ctrl: CommandQueue) -> Self {
        Self {
            slots: (0..MAX_SOCKET).map(|_| Slot::new()).collect(),
            alloc_id: AtomicI32::new(0),
            ctrl,
        }
    }

    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    pub(crate) fn slot_of(&self, id: SocketId) -> &Slot {
        &self.slots[slot_index(id.raw())]
    }

    pub(crate) fn is_live(&self, id: SocketId) -> bool {
        self.slot_of(id).is_live(id)
    }

    /// Allocate an id and claim its slot.
    ///
    /// Ids are positive 31 bit values from a monotonic counter; the counter
    /// wraps by clearing the sign bit. A slot stays non-`Invalid` for the
    /// whole life of its id, so an old id can never alias a new socket in
    /// the same slot.
    pub(crate) fn reserve_id(&self) -> Option<SocketId> {
        for _ in 0..MAX_SOCKET {
            let mut id = self.alloc_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1);

            if id < 0 {
                id = self.alloc_id.fetch_and(0x7fff_ffff, Ordering::AcqRel) & 0x7fff_ffff;
            }

            let slot = &self.slots[slot_index(id)];

            if slot.state() == SlotState::Invalid && slot.try_reserve() {
                slot.set_id(id);

                return Some(SocketId::from_raw(id));
            }
        }

        None
    }
}

/// Result of one reactor poll step.
pub(crate) enum Polled {
    /// An event message for the service owning the socket.
    Message(Handle, SocketMessage),
    /// The exit command was received; the reactor is done.
    Exit,
    /// The readiness wait failed; the caller decides whether to carry on.
    Failed,
}

fn message(owner: Handle, id: SocketId, event: SocketEvent) -> Option<Polled> {
    Some(Polled::Message(owner, SocketMessage { id, event }))
}

#[derive(Clone, Copy)]
enum Priority {
    High,
    Low,
}

enum Flush {
    Idle,
    Error(io::Error),
}

/// Create the command side and the reactor it feeds.
pub(crate) fn create() -> Result<(Sockets, Reactor), SocketError> {
    let setup = |e: io::Error| SocketError::Create(e.to_string());

    let poller = Poller::new().map_err(setup)?;
    let (notify_rx, notify_tx) = sys::pipe().map_err(setup)?;

    sys::set_nonblocking(notify_rx.as_raw_fd()).map_err(setup)?;
    sys::set_nonblocking(notify_tx.as_raw_fd()).map_err(setup)?;
    poller.add(notify_rx.as_raw_fd(), CTRL_KEY).map_err(setup)?;

    let shared = Arc::new(SocketShared::new(CommandQueue::new(notify_tx)));

    Ok((
        Sockets::new(Arc::clone(&shared)),
        Reactor {
            shared,
            poller,
            notify_rx,
            events: Vec::new(),
            event_index: 0,
            udp_scratch: vec![0; MAX_UDP_PACKAGE],
        },
    ))
}

pub(crate) struct Reactor {
    shared: Arc<SocketShared>,
    poller: Poller,
    notify_rx: OwnedFd,
    events: Vec<PollEvent>,
    event_index: usize,
    udp_scratch: Vec<u8>,
}

impl Reactor {
    /// Advance the reactor until something happens: a message to deliver,
    /// the exit command, or a poll failure.
    pub(crate) fn poll(&mut self) -> Polled {
        loop {
            // Commands first; the wakeup byte guarantees the blocking wait
            // below returns promptly after a push.
            if let Some(request) = self.shared.ctrl.pop() {
                if let Some(polled) = self.execute(request) {
                    return polled;
                }

                continue;
            }

            if self.event_index >= self.events.len() {
                match self.poller.wait(&mut self.events, MAX_EVENT) {
                    Ok(()) => self.event_index = 0,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::error!("socket server: event wait failed: {}", e);

                        return Polled::Failed;
                    }
                }

                continue;
            }

            let event = self.events[self.event_index];
            self.event_index += 1;

            if event.key == CTRL_KEY {
                self.drain_notify();

                continue;
            }

            // Cleared by force_close when a socket died mid-batch.
            if event.readiness.is_empty() {
                continue;
            }

            if let Some(polled) = self.dispatch_event(event) {
                return polled;
            }
        }
    }

    fn drain_notify(&mut self) {
        let mut buf = [0u8; 64];

        loop {
            match sys::read(self.notify_rx.as_raw_fd(), &mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::error!("socket server: read self pipe failed: {}", e);

                    return;
                }
            }
        }
    }

    fn execute(&mut self, request: Request) -> Option<Polled> {
        match request {
            Request::Start { id, owner } => self.start_socket(id, owner),
            Request::Bind { id, fd, owner } => self.bind_socket(id, fd, owner),
            Request::Listen { id, fd, owner } => self.listen_socket(id, fd, owner),
            Request::Close {
                id,
                owner,
                shutdown,
            } => self.close_socket(id, owner, shutdown),
            Request::Open {
                id,
                owner,
                host,
                port,
            } => self.open_socket(id, owner, &host, port),
            Request::Exit => Some(Polled::Exit),
            Request::NoDelay { id } => {
                self.setopt_nodelay(id);

                None
            }
            Request::Udp {
                id,
                fd,
                protocol,
                owner,
            } => self.add_udp_socket(id, fd, protocol, owner),
            Request::SendHigh { id, data } => self.send_socket(id, data, Priority::High, None),
            Request::SendLow { id, data } => self.send_socket(id, data, Priority::Low, None),
            Request::SendUdp { id, data, to } => {
                self.send_socket(id, data, Priority::High, Some(to))
            }
            Request::SetUdpPeer { id, to } => self.set_udp_peer(id, to),
        }
    }

    fn dispatch_event(&mut self, event: PollEvent) -> Option<Polled> {
        let index = event.key;
        let shared = Arc::clone(&self.shared);
        let slot = shared.slot(index);

        match slot.state() {
            SlotState::Connecting => self.report_connect(slot, index),
            SlotState::Listening => self.report_accept(slot),
            SlotState::Invalid | SlotState::Reserved => {
                log::error!("socket server: event on dead slot {}", index);

                None
            }
            _ => {
                if event.readiness.contains(Readiness::READABLE) {
                    // SAFETY: reactor thread.
                    let protocol = unsafe { slot.core_mut() }.protocol;

                    let polled = if protocol == Protocol::Tcp {
                        self.forward_message_tcp(slot, index)
                    } else {
                        let polled = self.forward_message_udp(slot, index);

                        if matches!(
                            &polled,
                            Some(Polled::Message(_, m)) if matches!(m.event, SocketEvent::Udp { .. })
                        ) {
                            // More datagrams may be queued; revisit.
                            self.event_index -= 1;

                            return polled;
                        }

                        polled
                    };

                    let closed = matches!(
                        &polled,
                        Some(Polled::Message(_, m))
                            if matches!(m.event, SocketEvent::Close | SocketEvent::Error { .. })
                    );

                    if event.readiness.contains(Readiness::WRITABLE) && !closed {
                        // Keep the write half for the next poll call.
                        self.events[self.event_index - 1].readiness.remove(Readiness::READABLE);
                        self.event_index -= 1;
                    }

                    return polled;
                }

                if event.readiness.contains(Readiness::WRITABLE) {
                    return self.send_buffer(slot, index);
                }

                None
            }
        }
    }

    /// Attach a descriptor to a reserved slot, optionally registering read
    /// interest.
    fn init_slot(
        &self,
        index: usize,
        fd: RawFd,
        protocol: Protocol,
        owner: Handle,
        register: bool,
    ) -> io::Result<()> {
        let slot = self.shared.slot(index);

        debug_assert_eq!(slot.state(), SlotState::Reserved);

        if register {
            self.poller.add(fd, index)?;
        }

        // SAFETY: reactor thread.
        unsafe { slot.core_mut() }.reset(fd, protocol, owner);

        Ok(())
    }

    /// Drop every buffer, unregister and close the descriptor, and free the
    /// slot. Stale readiness events for the slot are neutralised so they
    /// cannot touch a successor socket.
    fn force_close(&mut self, index: usize) {
        let shared = Arc::clone(&self.shared);
        let slot = shared.slot(index);
        let state = slot.state();

        if state == SlotState::Invalid {
            return;
        }

        debug_assert!(state != SlotState::Reserved);

        // SAFETY: reactor thread.
        let core = unsafe { slot.core_mut() };
        core.clear_lists();

        let fd = core.fd;
        core.fd = -1;

        if state != SlotState::PendingAccept && state != SlotState::PendingListen {
            self.poller.del(fd);
        }

        // Descriptors adopted via `bind` belong to their creator.
        if state != SlotState::Bound {
            sys::close(fd);
        }

        slot.set_state(SlotState::Invalid);

        for i in self.event_index..self.events.len() {
            if self.events[i].key == index {
                self.events[i].readiness = Readiness::empty();
            }
        }
    }

    fn listen_socket(&mut self, id: SocketId, fd: RawFd, owner: Handle) -> Option<Polled> {
        let index = slot_index(id.raw());

        match self.init_slot(index, fd, Protocol::Tcp, owner, false) {
            Ok(()) => {
                // Silent until the owner calls start.
                self.shared.slot(index).set_state(SlotState::PendingListen);

                None
            }
            Err(e) => {
                sys::close(fd);
                self.shared.slot(index).set_state(SlotState::Invalid);

                message(owner, id, SocketEvent::Error {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn bind_socket(&mut self, id: SocketId, fd: RawFd, owner: Handle) -> Option<Polled> {
        let index = slot_index(id.raw());

        if let Err(e) = sys::set_nonblocking(fd) {
            self.shared.slot(index).set_state(SlotState::Invalid);

            return message(owner, id, SocketEvent::Error {
                reason: e.to_string(),
            });
        }

        match self.init_slot(index, fd, Protocol::Tcp, owner, true) {
            Ok(()) => {
                self.shared.slot(index).set_state(SlotState::Bound);

                message(owner, id, SocketEvent::Open {
                    info: "binding".to_owned(),
                })
            }
            Err(e) => {
                self.shared.slot(index).set_state(SlotState::Invalid);

                message(owner, id, SocketEvent::Error {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn open_socket(&mut self, id: SocketId, owner: Handle, host: &str, port: u16) -> Option<Polled> {
        let index = slot_index(id.raw());

        let addrs = match sys::resolve(host, port) {
            Ok(addrs) => addrs,
            Err(e) => {
                self.shared.slot(index).set_state(SlotState::Invalid);

                return message(owner, id, SocketEvent::Error {
                    reason: e.to_string(),
                });
            }
        };

        let mut last_err: Option<io::Error> = None;
        let mut opened: Option<(RawFd, bool, SocketAddr)> = None;

        for addr in addrs {
            match sys::tcp_connect_begin(addr) {
                Ok((fd, done)) => {
                    opened = Some((fd, done, addr));

                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }

        let Some((fd, done, addr)) = opened else {
            self.shared.slot(index).set_state(SlotState::Invalid);

            let reason = last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "connect failed".to_owned());

            return message(owner, id, SocketEvent::Error { reason });
        };

        if let Err(e) = self.init_slot(index, fd, Protocol::Tcp, owner, true) {
            sys::close(fd);
            self.shared.slot(index).set_state(SlotState::Invalid);

            return message(owner, id, SocketEvent::Error {
                reason: e.to_string(),
            });
        }

        let slot = self.shared.slot(index);

        if done {
            slot.set_state(SlotState::Connected);

            message(owner, id, SocketEvent::Open {
                info: addr.ip().to_string(),
            })
        } else {
            slot.set_state(SlotState::Connecting);

            if let Err(e) = self.poller.set_write(fd, index, true) {
                self.force_close(index);

                return message(owner, id, SocketEvent::Error {
                    reason: e.to_string(),
                });
            }

            None
        }
    }

    fn close_socket(&mut self, id: SocketId, owner: Handle, shutdown: bool) -> Option<Polled> {
        let index = slot_index(id.raw());
        let shared = Arc::clone(&self.shared);
        let slot = shared.slot(index);

        if !slot.is_live(id) {
            return message(owner, id, SocketEvent::Close);
        }

        // SAFETY: reactor thread.
        if !unsafe { slot.core_mut() }.send_buffer_empty() {
            let polled = self.send_buffer(slot, index);

            // Flushing may already have ended the socket; a drain warning is
            // swallowed because close supersedes it.
            if let Some(Polled::Message(_, m)) = &polled {
                if !matches!(m.event, SocketEvent::Warning { .. }) {
                    return polled;
                }
            }
        }

        // SAFETY: reactor thread.
        if shutdown || unsafe { slot.core_mut() }.send_buffer_empty() {
            self.force_close(index);

            return message(owner, id, SocketEvent::Close);
        }

        // Flush the remainder first, then die.
        slot.set_state(SlotState::HalfClose);

        None
    }

    fn start_socket(&mut self, id: SocketId, owner: Handle) -> Option<Polled> {
        let index = slot_index(id.raw());
        let shared = Arc::clone(&self.shared);
        let slot = shared.slot(index);

        if !slot.is_live(id) {
            return message(owner, id, SocketEvent::Error {
                reason: "invalid socket".to_owned(),
            });
        }

        match slot.state() {
            state @ (SlotState::PendingAccept | SlotState::PendingListen) => {
                let fd = {
                    // SAFETY: reactor thread.
                    let core = unsafe { slot.core_mut() };
                    core.owner = owner;
                    core.fd
                };

                if let Err(e) = self.poller.add(fd, index) {
                    self.force_close(index);

                    return message(owner, id, SocketEvent::Error {
                        reason: e.to_string(),
                    });
                }

                let info = if state == SlotState::PendingListen {
                    slot.set_state(SlotState::Listening);

                    // Report the actual bound address so listeners on port 0
                    // learn their port.
                    sys::local_addr(fd)
                        .map(|addr| addr.to_string())
                        .unwrap_or_else(|_| "start".to_owned())
                } else {
                    slot.set_state(SlotState::Connected);

                    "start".to_owned()
                };

                message(owner, id, SocketEvent::Open { info })
            }
            SlotState::Connected => {
                // SAFETY: reactor thread.
                unsafe { slot.core_mut() }.owner = owner;

                message(owner, id, SocketEvent::Open {
                    info: "transfer".to_owned(),
                })
            }
            // Half closed: its close event arrives on its own.
            _ => None,
        }
    }

    fn setopt_nodelay(&mut self, id: SocketId) {
        let slot = self.shared.slot_of(id);

        if slot.is_live(id) {
            // SAFETY: reactor thread.
            let core = unsafe { slot.core_mut() };

            if core.protocol == Protocol::Tcp {
                sys::set_nodelay(core.fd);
            }
        }
    }

    fn add_udp_socket(
        &mut self,
        id: SocketId,
        fd: RawFd,
        protocol: Protocol,
        owner: Handle,
    ) -> Option<Polled> {
        let index = slot_index(id.raw());

        match self.init_slot(index, fd, protocol, owner, true) {
            Ok(()) => {
                self.shared.slot(index).set_state(SlotState::Connected);

                None
            }
            Err(e) => {
                log::error!("socket server: add udp socket {} failed: {}", id, e);
                sys::close(fd);
                self.shared.slot(index).set_state(SlotState::Invalid);

                None
            }
        }
    }

    fn set_udp_peer(&mut self, id: SocketId, to: UdpAddress) -> Option<Polled> {
        let slot = self.shared.slot_of(id);

        if !slot.is_live(id) {
            return None;
        }

        // SAFETY: reactor thread.
        let core = unsafe { slot.core_mut() };

        if to.protocol() != core.protocol {
            return message(core.owner, id, SocketEvent::Error {
                reason: "protocol mismatch".to_owned(),
            });
        }

        core.udp_peer = Some(to);

        None
    }

    /// Queue one send, writing directly when the socket is idle.
    ///
    /// If the direct write completes partially, the remainder goes to the
    /// *high* list regardless of the requested priority so the byte stream
    /// stays in order.
    fn send_socket(
        &mut self,
        id: SocketId,
        data: Box<[u8]>,
        priority: Priority,
        to: Option<UdpAddress>,
    ) -> Option<Polled> {
        enum AfterSend {
            Done,
            Queued,
            EnableWrite,
            Closed(io::Error),
        }

        let index = slot_index(id.raw());
        let shared = Arc::clone(&self.shared);
        let slot = shared.slot(index);
        let state = slot.state();

        if !slot.is_live(id) || state == SlotState::HalfClose || state == SlotState::PendingAccept {
            return None;
        }

        if state == SlotState::PendingListen || state == SlotState::Listening {
            log::error!("socket server: write to listen socket {}", id);

            return None;
        }

        let (owner, fd, after, warn) = {
            // SAFETY: reactor thread.
            let core = unsafe { slot.core_mut() };
            let owner = core.owner;
            let fd = core.fd;

            let after = if core.send_buffer_empty() && state == SlotState::Connected {
                match core.protocol {
                    Protocol::Tcp => match sys::write(fd, &data) {
                        Ok(n) if n == data.len() => AfterSend::Done,
                        Ok(n) => {
                            core.push_high(WriteBuffer::tcp(data, n));

                            AfterSend::EnableWrite
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            core.push_high(WriteBuffer::tcp(data, 0));

                            AfterSend::EnableWrite
                        }
                        Err(e) => AfterSend::Closed(e),
                    },
                    Protocol::Udp | Protocol::Udp6 => {
                        let Some(to) = to.or(core.udp_peer) else {
                            log::error!("socket server: udp socket {} has no peer address", id);

                            return None;
                        };

                        match sys::send_to(fd, &data, &to.socket_addr()) {
                            Ok(n) if n == data.len() => AfterSend::Done,
                            _ => {
                                let buffer = WriteBuffer::udp(data, to);

                                match priority {
                                    Priority::High => core.push_high(buffer),
                                    Priority::Low => core.push_low(buffer),
                                }

                                AfterSend::EnableWrite
                            }
                        }
                    }
                }
            } else {
                match core.protocol {
                    Protocol::Tcp => {
                        let buffer = WriteBuffer::tcp(data, 0);

                        match priority {
                            Priority::High => core.push_high(buffer),
                            Priority::Low => core.push_low(buffer),
                        }
                    }
                    Protocol::Udp | Protocol::Udp6 => {
                        let Some(to) = to.or(core.udp_peer) else {
                            log::error!("socket server: udp socket {} has no peer address", id);

                            return None;
                        };

                        let buffer = WriteBuffer::udp(data, to);

                        match priority {
                            Priority::High => core.push_high(buffer),
                            Priority::Low => core.push_low(buffer),
                        }
                    }
                }

                AfterSend::Queued
            };

            let warn = if !matches!(&after, AfterSend::Closed(_))
                && core.wb_size >= WARNING_SIZE
                && core.wb_size >= core.warn_size
            {
                core.warn_size = if core.warn_size == 0 {
                    WARNING_SIZE * 2
                } else {
                    core.warn_size * 2
                };

                Some(core.wb_size.div_ceil(1024))
            } else {
                None
            };

            (owner, fd, after, warn)
        };

        match after {
            AfterSend::Closed(e) => {
                log::error!("socket server: write to {} (fd={}) failed: {}", id, fd, e);
                self.force_close(index);

                return message(owner, id, SocketEvent::Close);
            }
            AfterSend::EnableWrite => {
                if let Err(e) = self.poller.set_write(fd, index, true) {
                    log::error!("socket server: enable write on {} failed: {}", id, e);
                }
            }
            AfterSend::Done | AfterSend::Queued => {}
        }

        if let Some(kilobytes) = warn {
            return message(owner, id, SocketEvent::Warning { kilobytes });
        }

        None
    }

    /// Drain the write lists on a writable event: the whole high list
    /// first, then the low list. A low buffer interrupted mid-transfer is
    /// promoted to the (empty) high list so nothing can overtake its tail.
    /// Once both lists drain, write interest is dropped; a half closed
    /// socket dies here.
    fn send_buffer(&mut self, slot: &Slot, index: usize) -> Option<Polled> {
        enum AfterFlush {
            CloseNow,
            Blocked,
            Drained { warned: bool },
        }

        let id = SocketId::from_raw(slot.id());

        let (owner, fd, after) = {
            // SAFETY: reactor thread; the borrow ends before any teardown.
            let core = unsafe { slot.core_mut() };
            let owner = core.owner;
            let fd = core.fd;

            let after = 'flush: {
                if let Flush::Error(e) =
                    flush_list(fd, core.protocol, &mut core.high, &mut core.wb_size)
                {
                    log::error!("socket server: flush {} failed: {}", id, e);

                    break 'flush AfterFlush::CloseNow;
                }

                if !core.high.is_empty() {
                    break 'flush AfterFlush::Blocked;
                }

                if !core.low.is_empty() {
                    if let Flush::Error(e) =
                        flush_list(fd, core.protocol, &mut core.low, &mut core.wb_size)
                    {
                        log::error!("socket server: flush {} failed: {}", id, e);

                        break 'flush AfterFlush::CloseNow;
                    }

                    if !core.low.is_empty() {
                        if core.low.front().is_some_and(WriteBuffer::is_partial) {
                            if let Some(buffer) = core.low.pop_front() {
                                debug_assert!(core.high.is_empty());
                                core.high.push_back(buffer);
                            }
                        }

                        break 'flush AfterFlush::Blocked;
                    }
                }

                debug_assert_eq!(core.wb_size, 0);

                let warned = core.warn_size > 0;
                core.warn_size = 0;

                AfterFlush::Drained { warned }
            };

            (owner, fd, after)
        };

        match after {
            AfterFlush::CloseNow => {
                self.force_close(index);

                message(owner, id, SocketEvent::Close)
            }
            AfterFlush::Blocked => None,
            AfterFlush::Drained { warned } => {
                if let Err(e) = self.poller.set_write(fd, index, false) {
                    log::error!("socket server: disable write on {} failed: {}", id, e);
                }

                if slot.state() == SlotState::HalfClose {
                    self.force_close(index);

                    return message(owner, id, SocketEvent::Close);
                }

                if warned {
                    // The buffer that warned earlier has fully drained.
                    message(owner, id, SocketEvent::Warning { kilobytes: 0 })
                } else {
                    None
                }
            }
        }
    }

    fn report_connect(&mut self, slot: &Slot, index: usize) -> Option<Polled> {
        let id = SocketId::from_raw(slot.id());

        let (owner, fd, buffer_empty) = {
            // SAFETY: reactor thread.
            let core = unsafe { slot.core_mut() };

            (core.owner, core.fd, core.send_buffer_empty())
        };

        match sys::take_socket_error(fd) {
            Err(e) => {
                self.force_close(index);

                message(owner, id, SocketEvent::Error {
                    reason: e.to_string(),
                })
            }
            Ok(()) => {
                slot.set_state(SlotState::Connected);

                if buffer_empty {
                    let _ = self.poller.set_write(fd, index, false);
                }

                let info = sys::peer_addr(fd)
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_default();

                message(owner, id, SocketEvent::Open { info })
            }
        }
    }

    fn report_accept(&mut self, slot: &Slot) -> Option<Polled> {
        let id = SocketId::from_raw(slot.id());

        let (owner, fd) = {
            // SAFETY: reactor thread.
            let core = unsafe { slot.core_mut() };

            (core.owner, core.fd)
        };

        match sys::accept(fd) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::EMFILE) | Some(libc::ENFILE)
                ) =>
            {
                // The listener survives; report the descriptor exhaustion.
                message(owner, id, SocketEvent::Error {
                    reason: e.to_string(),
                })
            }
            Err(_) => None,
            Ok((client_fd, peer)) => {
                let Some(new_id) = self.shared.reserve_id() else {
                    sys::close(client_fd);

                    return None;
                };

                let new_index = slot_index(new_id.raw());

                sys::set_keepalive(client_fd);

                if let Err(e) = sys::set_nonblocking(client_fd) {
                    log::error!("socket server: accept setup failed: {}", e);
                    sys::close(client_fd);
                    self.shared.slot(new_index).set_state(SlotState::Invalid);

                    return None;
                }

                match self.init_slot(new_index, client_fd, Protocol::Tcp, owner, false) {
                    Ok(()) => {
                        // Parked until the owner starts it.
                        self.shared.slot(new_index).set_state(SlotState::PendingAccept);

                        message(owner, id, SocketEvent::Accept {
                            peer: new_id,
                            addr: peer.to_string(),
                        })
                    }
                    Err(e) => {
                        log::error!("socket server: accept setup failed: {}", e);
                        sys::close(client_fd);
                        self.shared.slot(new_index).set_state(SlotState::Invalid);

                        None
                    }
                }
            }
        }
    }

    fn forward_message_tcp(&mut self, slot: &Slot, index: usize) -> Option<Polled> {
        let id = SocketId::from_raw(slot.id());

        // SAFETY: reactor thread.
        let core = unsafe { slot.core_mut() };
        let owner = core.owner;
        let fd = core.fd;
        let size = core.read_size;

        let mut buf = vec![0u8; size];

        match sys::read(fd, &mut buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("socket server: spurious read wakeup on {}", id);

                None
            }
            Err(e) => {
                self.force_close(index);

                message(owner, id, SocketEvent::Error {
                    reason: e.to_string(),
                })
            }
            Ok(0) => {
                // Peer closed.
                self.force_close(index);

                message(owner, id, SocketEvent::Close)
            }
            Ok(n) => {
                if slot.state() == SlotState::HalfClose {
                    // Discard reads while flushing towards close.
                    return None;
                }

                // Adapt the buffer to the observed read sizes.
                if n == size {
                    core.read_size *= 2;
                } else if size > MIN_READ_BUFFER && n * 2 < size {
                    core.read_size /= 2;
                }

                buf.truncate(n);

                message(owner, id, SocketEvent::Data {
                    payload: buf.into_boxed_slice(),
                })
            }
        }
    }

    fn forward_message_udp(&mut self, slot: &Slot, index: usize) -> Option<Polled> {
        let id = SocketId::from_raw(slot.id());

        let (owner, fd, protocol) = {
            // SAFETY: reactor thread.
            let core = unsafe { slot.core_mut() };

            (core.owner, core.fd, core.protocol)
        };

        match sys::recv_from(fd, &mut self.udp_scratch) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                self.force_close(index);

                message(owner, id, SocketEvent::Error {
                    reason: e.to_string(),
                })
            }
            Ok((n, from)) => {
                let family_matches = matches!(
                    (protocol, from),
                    (Protocol::Udp, SocketAddr::V4(_)) | (Protocol::Udp6, SocketAddr::V6(_))
                );

                if !family_matches {
                    return None;
                }

                let payload = self.udp_scratch[..n].to_vec().into_boxed_slice();

                message(owner, id, SocketEvent::Udp {
                    payload,
                    from: UdpAddress::from(from),
                })
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        for index in 0..MAX_SOCKET {
            let state = self.shared.slot(index).state();

            if state != SlotState::Invalid && state != SlotState::Reserved {
                self.force_close(index);
            }
        }
    }
}

/// Write out one list as far as the kernel accepts.
fn flush_list(
    fd: RawFd,
    protocol: Protocol,
    list: &mut VecDeque<WriteBuffer>,
    wb_size: &mut u64,
) -> Flush {
    match protocol {
        Protocol::Tcp => flush_list_tcp(fd, list, wb_size),
        Protocol::Udp | Protocol::Udp6 => flush_list_udp(fd, list, wb_size),
    }
}

fn flush_list_tcp(fd: RawFd, list: &mut VecDeque<WriteBuffer>, wb_size: &mut u64) -> Flush {
    while let Some(buffer) = list.front_mut() {
        match sys::write(fd, buffer.remaining()) {
            Ok(n) => {
                *wb_size -= n as u64;

                if !buffer.advance(n) {
                    // Kernel buffer full mid-transfer.
                    return Flush::Idle;
                }

                list.pop_front();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flush::Idle,
            Err(e) => return Flush::Error(e),
        }
    }

    Flush::Idle
}

fn flush_list_udp(fd: RawFd, list: &mut VecDeque<WriteBuffer>, wb_size: &mut u64) -> Flush {
    while let Some(buffer) = list.front_mut() {
        let len = buffer.remaining_len();

        let Some(to) = buffer.udp_address else {
            log::error!("socket server: tcp buffer queued on udp fd {}", fd);
            *wb_size -= len as u64;
            list.pop_front();

            continue;
        };

        match sys::send_to(fd, buffer.remaining(), &to.socket_addr()) {
            // Datagrams either go out whole or not at all.
            Ok(_) => {
                *wb_size -= len as u64;
                list.pop_front();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flush::Idle,
            Err(e) => {
                // A bad datagram does not condemn the socket; drop it.
                log::error!("socket server: udp send on fd {} failed: {}", fd, e);
                *wb_size -= len as u64;
                list.pop_front();
            }
        }
    }

    Flush::Idle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::pipe::CommandQueue;

    fn shared() -> (SocketShared, OwnedFd) {
        let (rx, tx) = sys::pipe().unwrap();

        (SocketShared::new(CommandQueue::new(tx)), rx)
    }

    #[test]
    fn reserve_assigns_distinct_slots() {
        let (shared, _rx) = shared();

        let a = shared.reserve_id().unwrap();
        let b = shared.reserve_id().unwrap();

        assert_ne!(a, b);
        assert!(shared.slot_of(a).is_live(a));
        assert!(shared.slot_of(b).is_live(b));
        assert_eq!(shared.slot_of(a).state(), SlotState::Reserved);
    }

    #[test]
    fn stale_id_is_not_live() {
        let (shared, _rx) = shared();

        let a = shared.reserve_id().unwrap();
        shared.slot_of(a).set_state(SlotState::Invalid);

        assert!(!shared.is_live(a));
    }

    #[test]
    fn wb_size_tracks_both_lists() {
        let slot = Slot::new();
        assert!(slot.try_reserve());

        // SAFETY: single threaded test.
        let core = unsafe { slot.core_mut() };

        core.push_high(WriteBuffer::tcp(vec![0u8; 100].into_boxed_slice(), 25));
        core.push_low(WriteBuffer::tcp(vec![0u8; 50].into_boxed_slice(), 0));

        assert_eq!(core.wb_size, 75 + 50);

        core.clear_lists();

        assert_eq!(core.wb_size, 0);
    }
}
