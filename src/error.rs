//! Apiary error types.

use crate::handle::Handle;
use crate::socket::SocketId;

/// An apiary runtime error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A service registry or message routing error occurred.
    Handle(HandleError),
    /// A socket server error occurred.
    Socket(SocketError),
}

impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Handle(e) => write!(f, "handle: {}", e),
            Error::Socket(e) => write!(f, "socket: {}", e),
        }
    }
}

/// Service registry and message routing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    /// The 24 bit local handle space (or the slot table) is exhausted.
    Exhausted,
    /// The name is already registered to another service.
    DuplicateName,
    /// The destination service has been retired or never existed.
    Dead(Handle),
    /// A message with a payload was sent to the zero handle.
    BadDestination,
    /// Session allocation was requested but the sending context is gone.
    NoSessionSource,
}

impl std::error::Error for HandleError {}

impl core::fmt::Display for HandleError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HandleError::Exhausted => f.write_str("handle space exhausted"),
            HandleError::DuplicateName => f.write_str("name already registered"),
            HandleError::Dead(handle) => write!(f, "service {} is gone", handle),
            HandleError::BadDestination => f.write_str("destination address can't be zero"),
            HandleError::NoSessionSource => {
                f.write_str("no live source context to allocate a session from")
            }
        }
    }
}

/// Socket server errors reported to the *caller* of the socket API.
///
/// Failures discovered inside the reactor are delivered asynchronously as
/// [`SocketEvent::Error`](crate::SocketEvent) messages instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// All 2^16 socket slots are in use.
    LimitReached,
    /// The socket id does not name a live socket any more.
    Stale(SocketId),
    /// A host name or address could not be resolved.
    Resolve(String),
    /// Creating, binding or listening on a socket failed.
    Create(String),
    /// A UDP address family does not match the socket's protocol.
    ProtocolMismatch,
}

impl std::error::Error for SocketError {}

impl core::fmt::Display for SocketError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SocketError::LimitReached => f.write_str("socket slot limit reached"),
            SocketError::Stale(id) => write!(f, "socket {} is closed or reused", id),
            SocketError::Resolve(reason) => write!(f, "address resolution failed: {}", reason),
            SocketError::Create(reason) => write!(f, "socket setup failed: {}", reason),
            SocketError::ProtocolMismatch => f.write_str("udp address family mismatch"),
        }
    }
}

impl From<HandleError> for Error {
    fn from(e: HandleError) -> Self {
        Self::Handle(e)
    }
}

impl From<SocketError> for Error {
    fn from(e: SocketError) -> Self {
        Self::Socket(e)
    }
}
