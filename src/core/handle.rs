//! # Handle Registry
//!
//! Engine-scoped slot table that hands out small, generation-checked
//! [`Handle`]s for engine resources.
//!
//! A handle resolves only while its resource is registered. Releasing a
//! resource bumps the slot generation, so a stale handle keeps failing even
//! after the slot is reused for something else. Slots whose generation would
//! wrap are retired instead of reused.
//!
//! Lookups go through [`HandleGuard`], which holds a reference count on the
//! slot for as long as it lives. A released slot is not recycled until every
//! guard taken on it has been dropped.
//!
//! ## Usage
//! ```rust
//! use reactor_net::core::handle::HandleRegistry;
//!
//! let registry = HandleRegistry::new();
//! let handle = registry.insert(42usize);
//!
//! {
//!     let guard = registry.acquire(handle).expect("live handle");
//!     assert_eq!(*guard, 42);
//! }
//!
//! assert_eq!(registry.release(handle), Some(42));
//! assert!(registry.acquire(handle).is_none());
//! ```
//!
//! Handles are tied to the thread that owns the engine:
//! ```rust,compile_fail
//! fn assert_send<T: Send>() {}
//! assert_send::<reactor_net::Handle>();
//! ```

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::rc::Rc;
use tracing::trace;

/// First generation handed out for a fresh slot. Zero is reserved so the raw
/// value `0` never names a live resource.
const FIRST_GENERATION: u32 = 1;

/// Indirect, validity-checked reference to a registry entry
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
    _not_send: PhantomData<*const ()>,
}

impl Handle {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _not_send: PhantomData,
        }
    }

    /// Slot index
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation this handle was issued under
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a single integer for hosts that pass handles around as numbers
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Unpack a raw handle. Returns `None` for `0`, which is never issued.
    pub fn from_raw(raw: u64) -> Option<Self> {
        let generation = (raw >> 32) as u32;
        if generation == 0 {
            return None;
        }
        Some(Self::new(raw as u32, generation))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    refs: u32,
    value: Option<T>,
}

#[derive(Debug)]
struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Slots<T> {
    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        self.entries
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    /// Return an emptied, unreferenced slot to the free list unless its
    /// generation space is exhausted.
    fn recycle(&mut self, index: u32) {
        let Some(slot) = self.entries.get(index as usize) else {
            return;
        };
        if slot.value.is_some() || slot.refs > 0 {
            return;
        }
        if slot.generation == u32::MAX {
            trace!(index, "Retiring handle slot with exhausted generations");
            return;
        }
        self.free.push(index);
    }
}

/// Slot table mapping [`Handle`]s to resources
///
/// Cloning the registry yields another view of the same table.
#[derive(Debug)]
pub struct HandleRegistry<T> {
    slots: Rc<RefCell<Slots<T>>>,
}

impl<T> Clone for HandleRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Rc::clone(&self.slots),
        }
    }
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            slots: Rc::new(RefCell::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            })),
        }
    }

    /// Register a resource and return a fresh handle for it
    pub fn insert(&self, value: T) -> Handle {
        let mut slots = self.slots.borrow_mut();
        slots.live += 1;

        if let Some(index) = slots.free.pop() {
            let slot = &mut slots.entries[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = slots.entries.len() as u32;
        slots.entries.push(Slot {
            generation: FIRST_GENERATION,
            refs: 0,
            value: Some(value),
        });
        Handle::new(index, FIRST_GENERATION)
    }

    /// Invalidate a handle and hand the resource back to the caller.
    ///
    /// Returns `None` if the handle was already stale.
    pub fn release(&self, handle: Handle) -> Option<T> {
        let mut slots = self.slots.borrow_mut();
        slots.slot(handle)?;

        let slot = &mut slots.entries[handle.index as usize];
        let value = slot.value.take();
        slot.generation = slot.generation.saturating_add(1);
        slots.live -= 1;
        slots.recycle(handle.index);

        trace!(%handle, "Handle released");
        value
    }

    /// Whether the handle still resolves
    pub fn contains(&self, handle: Handle) -> bool {
        self.slots.borrow().slot(handle).is_some()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.slots.borrow().live
    }

    /// Whether there are no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every live entry. Outstanding handles all go stale.
    ///
    /// Released values are dropped after the table is unlocked, so a value
    /// that owns a guard into this registry can be cleared safely.
    pub fn clear(&self) {
        let mut released = Vec::new();
        {
            let mut slots = self.slots.borrow_mut();
            for index in 0..slots.entries.len() as u32 {
                let slot = &mut slots.entries[index as usize];
                if let Some(value) = slot.value.take() {
                    slot.generation = slot.generation.saturating_add(1);
                    released.push(value);
                    slots.live -= 1;
                    slots.recycle(index);
                }
            }
        }
        drop(released);
    }
}

impl<T: Clone> HandleRegistry<T> {
    /// Look up a handle, taking a reference on its slot until the guard drops.
    ///
    /// Fails softly with `None` when the handle is stale or was never issued.
    pub fn acquire(&self, handle: Handle) -> Option<HandleGuard<T>> {
        let mut slots = self.slots.borrow_mut();
        let value = slots.slot(handle)?.value.clone()?;
        slots.entries[handle.index as usize].refs += 1;

        Some(HandleGuard {
            slots: Rc::clone(&self.slots),
            handle,
            value,
        })
    }

    /// Resolve a handle to a copy of its resource
    pub fn get(&self, handle: Handle) -> Option<T> {
        self.acquire(handle).map(|guard| guard.value.clone())
    }
}

/// Scoped lookup of a registry entry
///
/// Dereferences to the resource as it was when the guard was taken and
/// releases its slot reference on drop.
pub struct HandleGuard<T> {
    slots: Rc<RefCell<Slots<T>>>,
    handle: Handle,
    value: T,
}

impl<T> HandleGuard<T> {
    /// The handle this guard was acquired through
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Whether the entry has been released since the guard was taken
    pub fn is_released(&self) -> bool {
        self.slots.borrow().slot(self.handle).is_none()
    }
}

impl<T> Deref for HandleGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for HandleGuard<T> {
    fn drop(&mut self) {
        let mut slots = self.slots.borrow_mut();
        let index = self.handle.index;
        if let Some(slot) = slots.entries.get_mut(index as usize) {
            slot.refs = slot.refs.saturating_sub(1);
        }
        slots.recycle(index);
    }
}

impl<T: fmt::Debug> fmt::Debug for HandleGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleGuard")
            .field("handle", &self.handle)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_acquire() {
        let registry = HandleRegistry::new();
        let a = registry.insert("a");
        let b = registry.insert("b");

        assert_ne!(a, b);
        assert_eq!(registry.get(a), Some("a"));
        assert_eq!(registry.get(b), Some("b"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_stale_handle_after_release() {
        let registry = HandleRegistry::new();
        let a = registry.insert(1u32);

        assert_eq!(registry.release(a), Some(1));
        assert!(registry.acquire(a).is_none());
        assert_eq!(registry.release(a), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_guard_outliving_clear_frees_its_slot() {
        let registry = HandleRegistry::new();
        let a = registry.insert(1u32);
        let guard = registry.acquire(a).expect("live handle");

        registry.clear();
        assert!(guard.is_released());
        assert_ne!(registry.insert(2u32).index(), a.index());

        drop(guard);
        let c = registry.insert(3u32);
        assert_eq!(c.index(), a.index());
        assert!(registry.get(a).is_none());
        assert_eq!(registry.get(c), Some(3));
    }

    #[test]
    fn test_reused_slot_does_not_resolve_old_handle() {
        let registry = HandleRegistry::new();
        let old = registry.insert(1u32);
        registry.release(old);

        let new = registry.insert(2u32);
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(registry.get(old).is_none());
        assert_eq!(registry.get(new), Some(2));
    }

    #[test]
    fn test_slot_held_until_guard_drops() {
        let registry = HandleRegistry::new();
        let a = registry.insert(1u32);

        let guard = registry.acquire(a).expect("live handle");
        registry.release(a);
        assert!(guard.is_released());

        // Slot is still referenced, so a new insert must take a fresh slot
        let b = registry.insert(2u32);
        assert_ne!(a.index(), b.index());

        drop(guard);
        let c = registry.insert(3u32);
        assert_eq!(a.index(), c.index());
        assert!(registry.get(a).is_none());
    }

    #[test]
    fn test_raw_roundtrip_and_null() {
        let registry = HandleRegistry::new();
        let a = registry.insert(());

        assert_eq!(Handle::from_raw(a.to_raw()), Some(a));
        assert_eq!(Handle::from_raw(0), None);
        assert_ne!(a.to_raw(), 0);
    }

    #[test]
    fn test_forged_handle_does_not_resolve() {
        let registry = HandleRegistry::new();
        registry.insert(1u32);

        let forged = Handle::from_raw(7u64 << 32).expect("non-zero raw");
        assert!(registry.acquire(forged).is_none());
        let out_of_range = Handle::from_raw((1u64 << 32) | 99).expect("non-zero raw");
        assert!(registry.acquire(out_of_range).is_none());
    }

    #[test]
    fn test_exhausted_slot_is_retired() {
        let registry = HandleRegistry::new();
        let a = registry.insert(1u32);
        registry.slots.borrow_mut().entries[0].generation = u32::MAX - 1;
        let a = Handle::new(a.index(), u32::MAX - 1);

        assert_eq!(registry.release(a), Some(1));
        let b = registry.insert(2u32);
        assert_ne!(b.index(), a.index());
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let registry = HandleRegistry::new();
        let handles: Vec<_> = (0..8u32).map(|i| registry.insert(i)).collect();

        registry.clear();

        assert!(registry.is_empty());
        assert!(handles.iter().all(|h| !registry.contains(*h)));
    }
}
