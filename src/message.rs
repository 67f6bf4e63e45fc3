//! Messages exchanged between services.

use crate::handle::Handle;
use crate::socket::SocketMessage;

/// Protocol tag carried by every message.
///
/// Codes 0 to 7 have wire semantics the core understands; 8 to 11 are
/// reserved for higher level frameworks layered on top of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Free-form text.
    Text = 0,
    /// A reply correlated to an earlier request by its session.
    Response = 1,
    /// Fan-out delivery.
    Multicast = 2,
    /// Raw client traffic forwarded by a gateway service.
    Client = 3,
    /// Runtime control traffic.
    System = 4,
    /// Inter-node routing traffic.
    Harbor = 5,
    /// A socket event produced by the reactor.
    Socket = 6,
    /// Delivery failure notice; the session names the failed request.
    Error = 7,
    /// Reserved for framework use.
    Reserved8 = 8,
    /// Reserved for framework use.
    Reserved9 = 9,
    /// Reserved for framework use.
    Reserved10 = 10,
    /// Reserved for framework use.
    Reserved11 = 11,
}

impl MessageKind {
    /// The numeric protocol code.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decode a protocol code.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Text,
            1 => Self::Response,
            2 => Self::Multicast,
            3 => Self::Client,
            4 => Self::System,
            5 => Self::Harbor,
            6 => Self::Socket,
            7 => Self::Error,
            8 => Self::Reserved8,
            9 => Self::Reserved9,
            10 => Self::Reserved10,
            11 => Self::Reserved11,
            _ => return None,
        })
    }
}

/// Session selection for [`send`](crate::ServiceContext::send).
///
/// A session is a 32 bit token used to correlate a reply with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Session {
    /// Fire and forget; the message carries session 0.
    #[default]
    None,
    /// Allocate a fresh session from the sending context.
    Alloc,
    /// Use the given session, typically when replying.
    Id(i32),
}

/// An owned message payload.
///
/// Payloads follow a linear ownership discipline: the sender allocates, the
/// message owns the data in flight, and the receiving handler is handed the
/// whole [`Message`] by value. Dropping it frees the payload; moving the
/// payload out transfers ownership to the receiver.
#[derive(Debug, Default)]
pub enum Payload {
    /// No payload.
    #[default]
    Empty,
    /// An owned byte buffer.
    Bytes(Box<[u8]>),
    /// An owned string, used by text and error messages.
    Text(String),
    /// A socket event from the reactor.
    Socket(Box<SocketMessage>),
}

impl Payload {
    /// Payload length in bytes. Socket events report their carried data
    /// length.
    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Bytes(data) => data.len(),
            Payload::Text(text) => text.len(),
            Payload::Socket(message) => message.event.data_len(),
        }
    }

    /// `true` when there is nothing attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the payload as bytes, when it has a byte representation.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(data) => Some(data),
            Payload::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Self {
        Payload::Bytes(data.into())
    }
}

impl From<Box<[u8]>> for Payload {
    fn from(data: Box<[u8]>) -> Self {
        Payload::Bytes(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Bytes(data.into_boxed_slice())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

/// A message queued in a service mailbox.
#[derive(Debug)]
pub struct Message {
    /// The sending service, or [`Handle::INVALID`] for runtime messages.
    pub source: Handle,
    /// Correlation token; 0 when the message expects no reply.
    pub session: i32,
    /// Protocol tag.
    pub kind: MessageKind,
    /// Owned payload.
    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn kind_codes_round_trip() {
        for code in 0..=11u8 {
            let kind = MessageKind::from_code(code).unwrap();

            assert_eq!(kind.code(), code);
        }

        assert_eq!(MessageKind::from_code(12), None);
    }

    #[test]
    fn payload_lengths() {
        assert_eq!(Payload::Empty.len(), 0);
        assert!(Payload::Empty.is_empty());
        assert_eq!(Payload::from("hello").len(), 5);
        assert_eq!(Payload::from(vec![1u8, 2, 3]).len(), 3);
        assert_eq!(
            Payload::from(vec![1u8, 2, 3]).as_bytes(),
            Some([1u8, 2, 3].as_slice())
        );
    }
}
