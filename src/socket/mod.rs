//! The socket server.
//!
//! A single reactor thread owns every descriptor. Services never touch
//! sockets directly: they submit commands through a userspace queue that
//! wakes the reactor via its self-pipe, and the reactor answers with
//! [`SocketMessage`]s delivered into the owning service's mailbox as
//! [`MessageKind::Socket`](crate::MessageKind::Socket) messages.

pub(crate) mod buffer;
pub(crate) mod pipe;
pub(crate) mod poll;
pub(crate) mod server;
pub(crate) mod slot;
pub(crate) mod sys;

use crate::error::SocketError;
use crate::handle::Handle;
use crate::socket::pipe::Request;
use crate::socket::server::SocketShared;
use crate::socket::slot::Protocol;
use core::fmt;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::Arc;

/// Identifier of one socket for the lifetime of that socket.
///
/// Ids are allocated from a monotonic counter and map onto a fixed table of
/// 2^16 slots; the id distinguishes generations of the same slot, so a
/// stale id can never observe events belonging to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(i32);

impl SocketId {
    pub(crate) const fn from_raw(id: i32) -> Self {
        Self(id)
    }

    /// The raw id value.
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A UDP peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpAddress(SocketAddr);

impl UdpAddress {
    /// The underlying socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub(crate) fn protocol(&self) -> Protocol {
        match self.0 {
            SocketAddr::V4(_) => Protocol::Udp,
            SocketAddr::V6(_) => Protocol::Udp6,
        }
    }
}

impl From<SocketAddr> for UdpAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<(IpAddr, u16)> for UdpAddress {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        Self(SocketAddr::new(ip, port))
    }
}

impl fmt::Display for UdpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What happened on a socket.
#[derive(Debug)]
pub enum SocketEvent {
    /// The socket became usable: a listener started, a connect completed or
    /// ownership transferred. `info` carries the peer or bound address.
    Open { info: String },
    /// The socket is gone, either on request or because the peer closed.
    Close,
    /// A listener accepted a connection, parked until `start` is called on
    /// `peer`.
    Accept { peer: SocketId, addr: String },
    /// The socket died with an error.
    Error { reason: String },
    /// Inbound TCP bytes.
    Data { payload: Box<[u8]> },
    /// An inbound datagram and its sender.
    Udp {
        payload: Box<[u8]>,
        from: UdpAddress,
    },
    /// The aggregate write buffer crossed a warning threshold; `kilobytes`
    /// is 0 when a previously reported buffer fully drained.
    Warning { kilobytes: u64 },
}

impl SocketEvent {
    /// Length of the carried data, if any.
    pub fn data_len(&self) -> usize {
        match self {
            SocketEvent::Data { payload } => payload.len(),
            SocketEvent::Udp { payload, .. } => payload.len(),
            _ => 0,
        }
    }
}

/// A socket event addressed to the owning service.
#[derive(Debug)]
pub struct SocketMessage {
    /// The socket the event happened on.
    pub id: SocketId,
    /// The event itself.
    pub event: SocketEvent,
}

/// Caller-side half of the socket server: validates ids cheaply and queues
/// command frames for the reactor. All operations are non-blocking.
pub(crate) struct Sockets {
    shared: Arc<SocketShared>,
}

impl Sockets {
    pub(crate) fn new(shared: Arc<SocketShared>) -> Self {
        Self { shared }
    }

    /// Resolve, bind and listen synchronously, then hand the descriptor to
    /// the reactor. Events stay disabled until `start`.
    pub(crate) fn listen(
        &self,
        owner: Handle,
        host: &str,
        port: u16,
        backlog: i32,
    ) -> Result<SocketId, SocketError> {
        let fd = sys::tcp_listen(host, port, backlog)?;

        let Some(id) = self.shared.reserve_id() else {
            sys::close(fd);

            return Err(SocketError::LimitReached);
        };

        self.shared.ctrl.push(Request::Listen { id, fd, owner });

        Ok(id)
    }

    /// Begin a non-blocking connect; resolution and the syscall run on the
    /// reactor thread.
    pub(crate) fn connect(
        &self,
        owner: Handle,
        host: &str,
        port: u16,
    ) -> Result<SocketId, SocketError> {
        let id = self.shared.reserve_id().ok_or(SocketError::LimitReached)?;

        self.shared.ctrl.push(Request::Open {
            id,
            owner,
            host: host.to_owned(),
            port,
        });

        Ok(id)
    }

    /// Adopt an existing descriptor, for example stdin.
    pub(crate) fn bind_fd(&self, owner: Handle, fd: RawFd) -> Result<SocketId, SocketError> {
        let id = self.shared.reserve_id().ok_or(SocketError::LimitReached)?;

        self.shared.ctrl.push(Request::Bind { id, fd, owner });

        Ok(id)
    }

    pub(crate) fn start(&self, owner: Handle, id: SocketId) {
        self.shared.ctrl.push(Request::Start { id, owner });
    }

    pub(crate) fn close(&self, owner: Handle, id: SocketId) {
        self.shared.ctrl.push(Request::Close {
            id,
            owner,
            shutdown: false,
        });
    }

    pub(crate) fn shutdown(&self, owner: Handle, id: SocketId) {
        self.shared.ctrl.push(Request::Close {
            id,
            owner,
            shutdown: true,
        });
    }

    pub(crate) fn send(&self, id: SocketId, data: Box<[u8]>) -> Result<(), SocketError> {
        if !self.shared.is_live(id) {
            return Err(SocketError::Stale(id));
        }

        self.shared.ctrl.push(Request::SendHigh { id, data });

        Ok(())
    }

    pub(crate) fn send_lowpriority(&self, id: SocketId, data: Box<[u8]>) -> Result<(), SocketError> {
        if !self.shared.is_live(id) {
            return Err(SocketError::Stale(id));
        }

        self.shared.ctrl.push(Request::SendLow { id, data });

        Ok(())
    }

    pub(crate) fn nodelay(&self, id: SocketId) {
        self.shared.ctrl.push(Request::NoDelay { id });
    }

    /// Open a UDP socket, bound to `local` when given.
    pub(crate) fn udp(
        &self,
        owner: Handle,
        local: Option<(&str, u16)>,
    ) -> Result<SocketId, SocketError> {
        let local_addr = match local {
            Some((host, port)) => Some(sys::resolve(host, port)?.remove(0)),
            None => None,
        };

        let (fd, protocol) =
            sys::udp_socket(local_addr).map_err(|e| SocketError::Create(e.to_string()))?;

        let Some(id) = self.shared.reserve_id() else {
            sys::close(fd);

            return Err(SocketError::LimitReached);
        };

        self.shared.ctrl.push(Request::Udp {
            id,
            fd,
            protocol,
            owner,
        });

        Ok(id)
    }

    pub(crate) fn udp_send(
        &self,
        id: SocketId,
        to: UdpAddress,
        data: Box<[u8]>,
    ) -> Result<(), SocketError> {
        if !self.shared.is_live(id) {
            return Err(SocketError::Stale(id));
        }

        self.shared.ctrl.push(Request::SendUdp { id, data, to });

        Ok(())
    }

    /// Set the default peer used by plain sends on a UDP socket.
    pub(crate) fn udp_connect(
        &self,
        id: SocketId,
        host: &str,
        port: u16,
    ) -> Result<(), SocketError> {
        let to = UdpAddress::from(sys::resolve(host, port)?.remove(0));

        if !self.shared.is_live(id) {
            return Err(SocketError::Stale(id));
        }

        self.shared.ctrl.push(Request::SetUdpPeer { id, to });

        Ok(())
    }

    /// Ask the reactor thread to shut down.
    pub(crate) fn exit(&self) {
        self.shared.ctrl.push(Request::Exit);
    }
}
