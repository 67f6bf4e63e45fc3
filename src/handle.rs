//! Service handles and the handle registry.
//!
//! Every service is addressed by a 32 bit [`Handle`]. The registry owns the
//! bidirectional map from handles to reference counted service contexts plus
//! an append-only, sorted name index for string aliases.

use crate::error::HandleError;
use crate::service::ServiceContext;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A 32 bit service address.
///
/// The upper 8 bits carry the harbor (node) id, the lower 24 bits a local
/// index. The zero value is never a valid address; it is used as the
/// anonymous source of runtime-generated messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// The invalid (zero) handle.
    pub const INVALID: Handle = Handle(0);

    pub(crate) const HARBOR_SHIFT: u32 = 24;
    pub(crate) const INDEX_MASK: u32 = 0x00ff_ffff;

    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw 32 bit value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The harbor (node) id stored in the upper 8 bits.
    pub const fn harbor(self) -> u8 {
        (self.0 >> Self::HARBOR_SHIFT) as u8
    }

    /// `true` for any non-zero handle.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{:08x}", self.0)
    }
}

const DEFAULT_SLOTS: usize = 4;

/// The handle to context map.
///
/// Readers (`grab`, `lookup`) vastly outnumber writers, so the whole table
/// sits behind a single read-write lock. `grab` clones the context `Arc`
/// under the read lock so a context can never be freed mid-send.
pub(crate) struct HandleRegistry {
    /// Harbor id pre-shifted into the top byte.
    harbor: u32,
    /// Number of live (registered) services.
    live: AtomicUsize,
    inner: spin::RwLock<Inner>,
}

struct Inner {
    /// Next local index candidate. Handle values are never reused while a
    /// reference exists; slot indices are reused after full release.
    cursor: u32,
    used: usize,
    slots: Vec<Option<Arc<ServiceContext>>>,
    /// Sorted by name for binary search. Append-only apart from retirement.
    names: Vec<(String, Handle)>,
}

impl HandleRegistry {
    pub(crate) fn new(harbor: u8) -> Self {
        Self {
            harbor: (harbor as u32) << Handle::HARBOR_SHIFT,
            live: AtomicUsize::new(0),
            inner: spin::RwLock::new(Inner {
                cursor: 1,
                used: 0,
                slots: vec![None; DEFAULT_SLOTS],
                names: Vec::new(),
            }),
        }
    }

    /// Allocate a handle and register the context built for it, atomically.
    ///
    /// The builder runs under the write lock so the new context is visible
    /// to `grab` the instant it exists.
    pub(crate) fn register_with<F>(&self, build: F) -> Result<Arc<ServiceContext>, HandleError>
    where
        F: FnOnce(Handle) -> Arc<ServiceContext>,
    {
        let mut inner = self.inner.write();

        if inner.used * 4 >= inner.slots.len() * 3 {
            inner.grow()?;
        }

        let cap = inner.slots.len();
        let mut local = inner.cursor & Handle::INDEX_MASK;

        // The capacity is a power of two, so stepping the local index by one
        // visits every slot residue within `cap` probes.
        for _ in 0..=cap {
            if local == 0 {
                local = 1;
            }

            let idx = (local as usize) & (cap - 1);

            if inner.slots[idx].is_none() {
                let handle = Handle(self.harbor | local);
                let ctx = build(handle);

                inner.slots[idx] = Some(Arc::clone(&ctx));
                inner.used += 1;
                inner.cursor = (local + 1) & Handle::INDEX_MASK;

                self.live.fetch_add(1, Ordering::AcqRel);

                return Ok(ctx);
            }

            local = (local + 1) & Handle::INDEX_MASK;
        }

        Err(HandleError::Exhausted)
    }

    /// Look up a context and take a reference to it.
    pub(crate) fn grab(&self, handle: Handle) -> Option<Arc<ServiceContext>> {
        if !handle.is_valid() {
            return None;
        }

        let inner = self.inner.read();
        let idx = (handle.raw() as usize) & (inner.slots.len() - 1);

        match &inner.slots[idx] {
            Some(ctx) if ctx.handle() == handle => Some(Arc::clone(ctx)),
            _ => None,
        }
    }

    /// Drop the registry's reference to a service.
    ///
    /// Returns `false` when the handle is not (or no longer) registered. Any
    /// name aliases pointing at the handle are removed with it.
    pub(crate) fn retire(&self, handle: Handle) -> bool {
        let mut inner = self.inner.write();
        let idx = (handle.raw() as usize) & (inner.slots.len() - 1);

        let registered = matches!(&inner.slots[idx], Some(ctx) if ctx.handle() == handle);
        if !registered {
            return false;
        }

        let ctx = inner.slots[idx].take();

        inner.used -= 1;
        inner.names.retain(|(_, named)| *named != handle);
        drop(inner);

        self.live.fetch_sub(1, Ordering::AcqRel);

        // The context may tear down here, outside the write lock.
        drop(ctx);

        true
    }

    /// Retire every registered service.
    pub(crate) fn retire_all(&self) {
        let mut inner = self.inner.write();
        let drained: Vec<_> = inner.slots.iter_mut().filter_map(Option::take).collect();

        inner.used = 0;
        inner.names.clear();
        drop(inner);

        self.live.fetch_sub(drained.len(), Ordering::AcqRel);
        drop(drained);
    }

    /// Register a string alias. Duplicate names are rejected.
    pub(crate) fn name(&self, handle: Handle, name: &str) -> Result<(), HandleError> {
        let mut inner = self.inner.write();

        match inner.names.binary_search_by(|(n, _)| n.as_str().cmp(name)) {
            Ok(_) => Err(HandleError::DuplicateName),
            Err(at) => {
                inner.names.insert(at, (name.to_owned(), handle));

                Ok(())
            }
        }
    }

    /// Resolve a string alias.
    pub(crate) fn lookup(&self, name: &str) -> Option<Handle> {
        let inner = self.inner.read();

        inner
            .names
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|at| inner.names[at].1)
    }

    /// Number of live services. The runtime shuts down when this hits zero.
    pub(crate) fn total(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl Inner {
    /// Double the slot table, rehashing every context to `handle & (cap - 1)`.
    ///
    /// Lookup probes a single slot, so rehashing must place every handle at
    /// its exact residue. If two live handles collide at the larger size,
    /// keep doubling until they spread out.
    fn grow(&mut self) -> Result<(), HandleError> {
        let mut new_cap = self.slots.len() * 2;

        'retry: loop {
            if new_cap > (Handle::INDEX_MASK as usize) + 1 {
                return Err(HandleError::Exhausted);
            }

            let mut new_slots: Vec<Option<Arc<ServiceContext>>> = vec![None; new_cap];

            for ctx in self.slots.iter().flatten() {
                let idx = (ctx.handle().raw() as usize) & (new_cap - 1);

                if new_slots[idx].is_some() {
                    new_cap *= 2;

                    continue 'retry;
                }

                new_slots[idx] = Some(Arc::clone(ctx));
            }

            self.slots = new_slots;

            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_layout() {
        let handle = Handle::from_raw(0x05_00_00_2a);

        assert_eq!(handle.harbor(), 5);
        assert_eq!(handle.raw() & Handle::INDEX_MASK, 0x2a);
        assert!(handle.is_valid());
        assert!(!Handle::INVALID.is_valid());
    }

    #[test]
    fn display_matches_log_format() {
        assert_eq!(Handle::from_raw(0x0100_0001).to_string(), ":01000001");
    }
}
