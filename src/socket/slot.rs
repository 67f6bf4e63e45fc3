//! The reactor's fixed slot table.
//!
//! Sockets live in a fixed array of 2^16 slots indexed by `id % 2^16`. The
//! `id` and `state` fields are atomic because any thread may reserve a slot
//! or run the cheap validity checks in the caller-side API; everything else
//! belongs to the reactor thread alone.

use crate::handle::Handle;
use crate::socket::buffer::WriteBuffer;
use crate::socket::{SocketId, UdpAddress};
use atomic_enum::atomic_enum;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, Ordering};
use std::collections::VecDeque;
use std::os::fd::RawFd;

/// MAX_SOCKET is 2^MAX_SOCKET_P.
pub(crate) const MAX_SOCKET_P: usize = 16;
pub(crate) const MAX_SOCKET: usize = 1 << MAX_SOCKET_P;

/// Initial (and minimum) adaptive TCP read buffer size.
pub(crate) const MIN_READ_BUFFER: usize = 64;

pub(crate) fn slot_index(id: i32) -> usize {
    (id as u32 as usize) % MAX_SOCKET
}

#[atomic_enum]
#[derive(PartialEq, Default)]
pub(crate) enum SlotState {
    /// Free slot, claimable via compare-and-swap.
    #[default]
    Invalid = 0,
    /// Claimed by `reserve_id`, not yet backed by a descriptor.
    Reserved = 1,
    /// Listener prepared but not delivering events until `start`.
    PendingListen = 2,
    /// Listener accepting connections.
    Listening = 3,
    /// Non-blocking connect in flight.
    Connecting = 4,
    /// Established; readable and writable.
    Connected = 5,
    /// Close requested with writes pending; dies once flushed.
    HalfClose = 6,
    /// Accepted connection parked until the owner calls `start`.
    PendingAccept = 7,
    /// Foreign descriptor adopted via `bind`; never closed by the reactor.
    Bound = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    Tcp,
    Udp,
    Udp6,
}

/// Reactor-private half of a slot.
pub(crate) struct SlotCore {
    pub fd: RawFd,
    pub protocol: Protocol,
    /// The service receiving this socket's events. Stored as a plain handle
    /// so a dead service never leaves a dangling pointer behind; resolution
    /// goes through the handle registry at delivery time.
    pub owner: Handle,
    pub high: VecDeque<WriteBuffer>,
    pub low: VecDeque<WriteBuffer>,
    /// Unsent bytes across both lists.
    pub wb_size: u64,
    /// Write buffer warning threshold, doubled each time it is breached and
    /// reset when the buffer drains.
    pub warn_size: u64,
    /// Adaptive TCP read buffer size.
    pub read_size: usize,
    /// Default peer for plain sends on a UDP socket.
    pub udp_peer: Option<UdpAddress>,
}

impl SlotCore {
    fn empty() -> Self {
        Self {
            fd: -1,
            protocol: Protocol::Tcp,
            owner: Handle::INVALID,
            high: VecDeque::new(),
            low: VecDeque::new(),
            wb_size: 0,
            warn_size: 0,
            read_size: MIN_READ_BUFFER,
            udp_peer: None,
        }
    }

    /// Reinitialise for a freshly attached descriptor.
    pub(crate) fn reset(&mut self, fd: RawFd, protocol: Protocol, owner: Handle) {
        debug_assert!(self.high.is_empty());
        debug_assert!(self.low.is_empty());

        self.fd = fd;
        self.protocol = protocol;
        self.owner = owner;
        self.wb_size = 0;
        self.warn_size = 0;
        self.read_size = MIN_READ_BUFFER;
        self.udp_peer = None;
    }

    pub(crate) fn send_buffer_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    pub(crate) fn push_high(&mut self, buffer: WriteBuffer) {
        self.wb_size += buffer.remaining_len() as u64;
        self.high.push_back(buffer);
    }

    pub(crate) fn push_low(&mut self, buffer: WriteBuffer) {
        self.wb_size += buffer.remaining_len() as u64;
        self.low.push_back(buffer);
    }

    pub(crate) fn clear_lists(&mut self) {
        self.high.clear();
        self.low.clear();
        self.wb_size = 0;
    }
}

/// One socket slot.
pub(crate) struct Slot {
    id: AtomicI32,
    state: AtomicSlotState,
    core: UnsafeCell<SlotCore>,
}

// SAFETY: `core` is only ever accessed from the reactor thread (through
// `core_mut`); every other thread goes through the atomic `id` and `state`
// fields. A slot leaves `Invalid` only via the reserve CAS, so the reactor
// cannot observe a half-initialised slot.
unsafe impl Sync for Slot {}

impl Slot {
    pub(crate) fn new() -> Self {
        Self {
            id: AtomicI32::new(0),
            state: AtomicSlotState::new(SlotState::Invalid),
            core: UnsafeCell::new(SlotCore::empty()),
        }
    }

    pub(crate) fn state(&self) -> SlotState {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: SlotState) {
        self.state.store(state, Ordering::Release);
    }

    /// Claim a free slot. The CAS is the allocation point: once it
    /// succeeds, no other thread can claim this slot until the socket dies.
    pub(crate) fn try_reserve(&self) -> bool {
        self.state
            .compare_exchange(
                SlotState::Invalid,
                SlotState::Reserved,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn id(&self) -> i32 {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn set_id(&self, id: i32) {
        self.id.store(id, Ordering::Release);
    }

    /// Cheap caller-side validity check: the id generation still matches
    /// and the slot has not been freed.
    pub(crate) fn is_live(&self, id: SocketId) -> bool {
        self.id() == id.raw() && self.state() != SlotState::Invalid
    }

    /// Access the reactor-private half.
    ///
    /// # Safety
    ///
    /// Must only be called from the reactor thread, and the returned
    /// reference must not outlive the current operation on this slot.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn core_mut(&self) -> &mut SlotCore {
        unsafe { &mut *self.core.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_claims_exactly_once() {
        let slot = Slot::new();

        assert!(slot.try_reserve());
        assert!(!slot.try_reserve());
        assert_eq!(slot.state(), SlotState::Reserved);

        slot.set_state(SlotState::Invalid);
        assert!(slot.try_reserve());
    }

    #[test]
    fn liveness_requires_matching_generation() {
        let slot = Slot::new();

        assert!(slot.try_reserve());
        slot.set_id(3 + MAX_SOCKET as i32);

        assert!(slot.is_live(SocketId::from_raw(3 + MAX_SOCKET as i32)));
        // Same slot index, older generation.
        assert!(!slot.is_live(SocketId::from_raw(3)));

        slot.set_state(SlotState::Invalid);
        assert!(!slot.is_live(SocketId::from_raw(3 + MAX_SOCKET as i32)));
    }
}
