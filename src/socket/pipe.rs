//! Typed command frames from services to the reactor.
//!
//! Commands are queued in userspace under a spinlock; a one byte write to
//! the self-pipe wakes the reactor out of its blocking poll. Keeping the
//! payload out of the pipe means a burst of commands from thousands of
//! services can never block a sender on pipe capacity.

use crate::handle::Handle;
use crate::socket::slot::Protocol;
use crate::socket::{SocketId, UdpAddress};
use crate::socket::sys;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd};

/// A command frame addressed to the reactor.
#[derive(Debug)]
pub(crate) enum Request {
    /// Enable events for a prepared socket and bind its owner.
    Start { id: SocketId, owner: Handle },
    /// Adopt a foreign descriptor.
    Bind {
        id: SocketId,
        fd: std::os::fd::RawFd,
        owner: Handle,
    },
    /// Attach an already bound and listening descriptor.
    Listen {
        id: SocketId,
        fd: std::os::fd::RawFd,
        owner: Handle,
    },
    /// Close, or shut down immediately when `shutdown` is set.
    Close {
        id: SocketId,
        owner: Handle,
        shutdown: bool,
    },
    /// Begin a non-blocking connect.
    Open {
        id: SocketId,
        owner: Handle,
        host: String,
        port: u16,
    },
    /// Stop the reactor.
    Exit,
    /// Set `TCP_NODELAY`.
    NoDelay { id: SocketId },
    /// Attach a UDP descriptor.
    Udp {
        id: SocketId,
        fd: std::os::fd::RawFd,
        protocol: Protocol,
        owner: Handle,
    },
    /// Queue bytes on the high priority list.
    SendHigh { id: SocketId, data: Box<[u8]> },
    /// Queue bytes on the low priority list.
    SendLow { id: SocketId, data: Box<[u8]> },
    /// Send a datagram to an explicit peer.
    SendUdp {
        id: SocketId,
        data: Box<[u8]>,
        to: UdpAddress,
    },
    /// Set the default UDP peer.
    SetUdpPeer { id: SocketId, to: UdpAddress },
}

impl Request {
    /// One byte command code, written to the wakeup pipe for observability
    /// in strace-level debugging.
    fn code(&self) -> u8 {
        match self {
            Request::Start { .. } => b'S',
            Request::Bind { .. } => b'B',
            Request::Listen { .. } => b'L',
            Request::Close { .. } => b'K',
            Request::Open { .. } => b'O',
            Request::Exit => b'X',
            Request::NoDelay { .. } => b'T',
            Request::Udp { .. } => b'U',
            Request::SendHigh { .. } => b'D',
            Request::SendLow { .. } => b'P',
            Request::SendUdp { .. } => b'A',
            Request::SetUdpPeer { .. } => b'C',
        }
    }
}

pub(crate) struct CommandQueue {
    queue: spin::Mutex<VecDeque<Request>>,
    /// Write end of the reactor's self-pipe, non-blocking.
    notify: OwnedFd,
}

impl CommandQueue {
    pub(crate) fn new(notify: OwnedFd) -> Self {
        Self {
            queue: spin::Mutex::new(VecDeque::new()),
            notify,
        }
    }

    /// Queue a command and wake the reactor.
    pub(crate) fn push(&self, request: Request) {
        let code = request.code();

        self.queue.lock().push_back(request);

        // A full pipe only means wakeups are already pending, so dropping
        // the byte is fine; EINTR is retried by the helper.
        let _ = sys::write(self.notify.as_raw_fd(), &[code]);
    }

    pub(crate) fn pop(&self) -> Option<Request> {
        self.queue.lock().pop_front()
    }
}
